//! canopy.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default tracing filter when neither `RUST_LOG` nor `[log] filter` is set.
pub const DEFAULT_LOG_FILTER: &str = "info,canopyd=debug,canopy=debug";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub driver: DriverConfig,
    pub rollout: RolloutConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `canopy.redb`.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/canopy"),
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("canopy.redb")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub sweep_interval_secs: u64,
    /// Upper bound on rollout passes running at the same time.
    pub max_concurrent_passes: usize,
    /// Actions created or started per store transaction.
    pub action_batch_size: usize,
    pub enabled: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 10,
            max_concurrent_passes: 4,
            action_batch_size: 500,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Hold materialized rollouts in WAITING_FOR_APPROVAL until approved.
    pub require_approval: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub json: bool,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the driver cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.driver.sweep_interval_secs == 0 {
            anyhow::bail!("driver.sweep_interval_secs must be at least 1");
        }
        if self.driver.max_concurrent_passes == 0 {
            anyhow::bail!("driver.max_concurrent_passes must be at least 1");
        }
        if self.driver.action_batch_size == 0 {
            anyhow::bail!("driver.action_batch_size must be at least 1");
        }
        Ok(())
    }

    /// Filter to install: `[log] filter` or the built-in default.
    pub fn log_filter(&self) -> &str {
        self.log.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}
