//! canopy-state — embedded state store for Canopy rollouts.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for rollouts, rollout groups, group membership, and the
//! per-target deployment-action ledger.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{rollout}:{ordinal}`, `{rollout}:{group}:{target}`) are
//! zero-padded so that prefix range scans return records in creation order.
//!
//! Rollouts and groups carry an optimistic-concurrency `version`. A save
//! with a stale version fails with [`StateError::Conflict`].
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across blocking tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
