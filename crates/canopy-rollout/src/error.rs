//! Rollout engine error types.

use canopy_state::{RolloutId, RolloutStatus, StateError};
use thiserror::Error;

/// Errors that can occur while creating, driving, or operating rollouts.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No evaluator is registered for a tag.
    #[error("no {kind} evaluator registered for tag '{tag}'")]
    UnregisteredEvaluator { kind: &'static str, tag: String },

    #[error("invalid {kind} expression '{expression}': {reason}")]
    InvalidExpression {
        kind: &'static str,
        expression: String,
        reason: String,
    },

    /// A group has an error condition but no error action to run.
    #[error("group {group} has an error condition without an error action")]
    MissingErrorAction { group: u64 },

    #[error("invalid rollout: {0}")]
    Invalid(String),

    #[error("rollout {rollout} is {status}, cannot {operation}")]
    IllegalState {
        rollout: RolloutId,
        status: RolloutStatus,
        operation: &'static str,
    },

    #[error("{principal} may not {operation}")]
    PermissionDenied {
        principal: String,
        operation: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Another pass holds the rollout's lock.
    #[error("rollout {0} is being processed, try again")]
    PassInFlight(RolloutId),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl EngineError {
    /// Operator-fixable misconfiguration. Never retried automatically.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::UnregisteredEvaluator { .. }
                | EngineError::InvalidExpression { .. }
                | EngineError::MissingErrorAction { .. }
        )
    }

    /// A later sweep working from fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::PassInFlight(_)
                | EngineError::State(
                    StateError::Conflict { .. }
                        | StateError::Open(_)
                        | StateError::Transaction(_)
                        | StateError::Table(_)
                        | StateError::Read(_)
                        | StateError::Write(_)
                )
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        let unregistered = EngineError::UnregisteredEvaluator {
            kind: "success action",
            tag: "pause".into(),
        };
        assert!(unregistered.is_configuration());
        assert!(!unregistered.is_retryable());

        let conflict = EngineError::from(StateError::Conflict {
            record: "group 3".into(),
            expected: 1,
            found: 2,
        });
        assert!(conflict.is_retryable());
        assert!(!conflict.is_configuration());

        let constraint = EngineError::from(StateError::Constraint("dup".into()));
        assert!(!constraint.is_retryable());

        assert!(EngineError::PassInFlight(4).is_retryable());
    }
}
