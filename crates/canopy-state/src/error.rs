//! Error types for the Canopy state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The record was modified since it was read.
    #[error("concurrent modification of {record}: expected version {expected}, found {found}")]
    Conflict {
        record: String,
        expected: u64,
        found: u64,
    },

    /// Terminal action statuses are write-once.
    #[error("action {key} is terminal ({status}), cannot move to {requested}")]
    TerminalAction {
        key: String,
        status: String,
        requested: String,
    },

    #[error("invalid transition for {record}: {from} -> {to}")]
    InvalidTransition {
        record: String,
        from: String,
        to: String,
    },

    #[error("constraint violated: {0}")]
    Constraint(String),
}

impl StateError {
    /// Whether re-reading and retrying later can succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}
