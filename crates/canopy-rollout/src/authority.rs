//! Execution context and authority elevation.
//!
//! Every mutating engine call takes an explicit [`ExecContext`] naming who
//! it runs as. Action evaluators always run elevated through
//! [`run_with_elevated_authority`], so group advancement never depends on
//! the permissions of whoever triggered a pass.

use tracing::trace;

use crate::error::{EngineError, EngineResult};

/// Who a unit of work runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    /// The engine itself. May do anything.
    System,
    /// A human or service operator.
    Operator {
        name: String,
        may_manage_rollouts: bool,
        may_approve_rollouts: bool,
    },
}

/// Context passed explicitly through every mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecContext {
    authority: Authority,
    /// Principal that caused an elevated context to exist.
    acting_for: Option<String>,
}

impl ExecContext {
    pub fn system() -> Self {
        Self {
            authority: Authority::System,
            acting_for: None,
        }
    }

    pub fn operator(name: impl Into<String>, may_manage_rollouts: bool) -> Self {
        Self {
            authority: Authority::Operator {
                name: name.into(),
                may_manage_rollouts,
                may_approve_rollouts: false,
            },
            acting_for: None,
        }
    }

    /// Also allow this operator to approve or deny rollouts.
    pub fn with_rollout_approval(mut self) -> Self {
        if let Authority::Operator {
            may_approve_rollouts,
            ..
        } = &mut self.authority
        {
            *may_approve_rollouts = true;
        }
        self
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn acting_for(&self) -> Option<&str> {
        self.acting_for.as_deref()
    }

    pub fn principal(&self) -> &str {
        match &self.authority {
            Authority::System => "system",
            Authority::Operator { name, .. } => name,
        }
    }

    pub fn can_manage_rollouts(&self) -> bool {
        match &self.authority {
            Authority::System => true,
            Authority::Operator {
                may_manage_rollouts,
                ..
            } => *may_manage_rollouts,
        }
    }

    pub fn can_approve_rollouts(&self) -> bool {
        match &self.authority {
            Authority::System => true,
            Authority::Operator {
                may_approve_rollouts,
                ..
            } => *may_approve_rollouts,
        }
    }

    pub fn require_rollout_approval(&self, operation: &'static str) -> EngineResult<()> {
        if self.can_approve_rollouts() {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied {
                principal: self.principal().to_string(),
                operation,
            })
        }
    }

    /// Fail with `PermissionDenied` unless this context may manage rollouts.
    pub fn require_rollout_management(&self, operation: &'static str) -> EngineResult<()> {
        if self.can_manage_rollouts() {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied {
                principal: self.principal().to_string(),
                operation,
            })
        }
    }
}

/// Turns a caller's context into one with system authority.
pub trait AuthorityElevation: Send + Sync {
    fn elevate(&self, caller: &ExecContext) -> ExecContext;
}

/// Default elevation: system authority, remembering the original caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemElevation;

impl AuthorityElevation for SystemElevation {
    fn elevate(&self, caller: &ExecContext) -> ExecContext {
        ExecContext {
            authority: Authority::System,
            acting_for: Some(
                caller
                    .acting_for()
                    .unwrap_or_else(|| caller.principal())
                    .to_string(),
            ),
        }
    }
}

/// Run `f` under the authority produced by `elevation` for `caller`.
pub fn run_with_elevated_authority<T>(
    elevation: &dyn AuthorityElevation,
    caller: &ExecContext,
    f: impl FnOnce(&ExecContext) -> T,
) -> T {
    let elevated = elevation.elevate(caller);
    trace!(caller = caller.principal(), "running with elevated authority");
    f(&elevated)
}
