pub mod config;

pub use config::{DriverConfig, EngineConfig, LogConfig, RolloutConfig, StoreConfig};
