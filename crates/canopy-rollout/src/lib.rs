//! Canopy rollout engine — staged deployment over ordered target groups.
//!
//! A rollout splits its targets into ordered groups and deploys to one
//! group at a time. The driver evaluates the active group's error and
//! success conditions on every sweep and runs the matching action
//! (advance to the next group, or pause the rollout).
//!
//! # Components
//!
//! - **`conditions`**: threshold condition evaluators over action counts
//! - **`actions`**: next-group and pause strategies
//! - **`registry`**: tag → evaluator lookup, validated at startup
//! - **`manager`**: creation, materialization, operator triggers, deletion
//! - **`driver`**: the recurring sweep and per-rollout evaluation pass
//! - **`backend`**: collaborator traits and their redb implementation
//! - **`authority`**: explicit execution context and elevation

pub mod actions;
pub mod authority;
pub mod backend;
pub mod conditions;
pub mod driver;
pub mod error;
pub mod locks;
pub mod manager;
pub mod registry;

pub use actions::{ActionEvaluator, ActionOutcome, Advance};
pub use authority::{
    Authority, AuthorityElevation, ExecContext, SystemElevation, run_with_elevated_authority,
};
pub use backend::{ActionLedger, ActionScheduler, RolloutRepository, StoreBackend};
pub use conditions::ConditionEvaluator;
pub use driver::{PassOutcome, RolloutDriver, Stage, StepOutcome, SweepReport};
pub use error::{EngineError, EngineResult};
pub use manager::{
    ApprovalDecision, Deletion, GroupDefinition, GroupPlan, RolloutCreate, RolloutManager,
    RolloutUpdate,
};
pub use registry::EvaluatorRegistry;
