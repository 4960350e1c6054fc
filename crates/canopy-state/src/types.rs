//! Domain types for the Canopy state store.
//!
//! These types represent the persisted state of rollouts, their ordered
//! groups, and the per-target deployment actions. All types are
//! serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a rollout.
pub type RolloutId = u64;

/// Unique identifier for a rollout group.
pub type GroupId = u64;

/// Opaque identifier of a device/target.
pub type TargetId = String;

/// Opaque identifier of the deployable artifact bundle.
pub type BundleId = String;

// ── Rollout ───────────────────────────────────────────────────────

/// Lifecycle status of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    /// Materialized, held until someone approves or denies it.
    WaitingForApproval,
    ApprovalDenied,
    Ready,
    Starting,
    Running,
    Paused,
    Finished,
    Error,
    Deleting,
    Deleted,
}

impl RolloutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::Creating => "creating",
            RolloutStatus::WaitingForApproval => "waiting_for_approval",
            RolloutStatus::ApprovalDenied => "approval_denied",
            RolloutStatus::Ready => "ready",
            RolloutStatus::Starting => "starting",
            RolloutStatus::Running => "running",
            RolloutStatus::Paused => "paused",
            RolloutStatus::Finished => "finished",
            RolloutStatus::Error => "error",
            RolloutStatus::Deleting => "deleting",
            RolloutStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A staged deployment campaign over a target population.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub name: String,
    pub description: Option<String>,
    /// Artifact bundle deployed to every target.
    pub bundle_id: BundleId,
    /// Target-selection query the membership was resolved from.
    pub target_query: String,
    pub status: RolloutStatus,
    /// Defaults for groups that do not override their conditions.
    pub conditions: GroupConditions,
    /// Targets assigned across all groups.
    pub total_targets: u64,
    /// Unix timestamp (seconds) at which a READY rollout starts by itself.
    pub start_at: Option<u64>,
    /// Soft-delete marker; set together with `Deleted`.
    pub deleted: bool,
    #[serde(default)]
    pub approval_decided_by: Option<String>,
    #[serde(default)]
    pub approval_remark: Option<String>,
    /// Optimistic-concurrency version, bumped on every save.
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Rollout group ─────────────────────────────────────────────────

/// Status of a rollout group. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Scheduled,
    Running,
    Finished,
    Error,
}

impl GroupStatus {
    fn rank(&self) -> u8 {
        match self {
            GroupStatus::Scheduled => 0,
            GroupStatus::Running => 1,
            GroupStatus::Finished | GroupStatus::Error => 2,
        }
    }

    /// Whether `next` is reachable without moving backwards.
    ///
    /// Re-writing the same status is allowed; FINISHED and ERROR are final.
    pub fn can_transition_to(&self, next: GroupStatus) -> bool {
        *self == next || next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Scheduled => "scheduled",
            GroupStatus::Running => "running",
            GroupStatus::Finished => "finished",
            GroupStatus::Error => "error",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered subset of a rollout's targets, advanced as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: GroupId,
    pub rollout_id: RolloutId,
    /// The group immediately before this one; `None` for the first group.
    pub parent: Option<GroupId>,
    /// Position in execution order, starting at 0.
    pub ordinal: u32,
    pub name: String,
    /// Share of the remaining targets this group was sized from.
    pub target_percentage: f32,
    /// Targets assigned at creation. Never mutated afterwards.
    pub target_count: u64,
    pub status: GroupStatus,
    pub conditions: GroupConditions,
    pub version: u64,
    pub updated_at: u64,
}

// ── Conditions and actions ────────────────────────────────────────

macro_rules! tag_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every tag in this space.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn tag(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.tag())
            }
        }
    };
}

tag_enum!(
    /// Decides whether a group has succeeded.
    SuccessCondition { Threshold => "threshold" }
);

tag_enum!(
    /// Decides whether a group has failed.
    ErrorCondition { Threshold => "threshold" }
);

tag_enum!(
    /// Strategy run when the success condition holds.
    SuccessAction { NextGroup => "next_group", Pause => "pause" }
);

tag_enum!(
    /// Strategy run when the error condition holds.
    ErrorAction { Pause => "pause" }
);

/// Success/error condition and action configuration of a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConditions {
    pub success_condition: SuccessCondition,
    /// Threshold expression, e.g. `"80"`.
    pub success_condition_exp: String,
    pub success_action: SuccessAction,
    pub success_action_exp: String,
    /// `None` disables error detection for the group.
    pub error_condition: Option<ErrorCondition>,
    pub error_condition_exp: String,
    pub error_action: Option<ErrorAction>,
    pub error_action_exp: String,
}

impl Default for GroupConditions {
    fn default() -> Self {
        Self {
            success_condition: SuccessCondition::Threshold,
            success_condition_exp: "100".to_string(),
            success_action: SuccessAction::NextGroup,
            success_action_exp: String::new(),
            error_condition: None,
            error_condition_exp: String::new(),
            error_action: None,
            error_action_exp: String::new(),
        }
    }
}

impl GroupConditions {
    /// Threshold success → next group, threshold error → pause.
    pub fn thresholds(success: u8, error: u8) -> Self {
        Self {
            success_condition_exp: success.to_string(),
            error_condition: Some(ErrorCondition::Threshold),
            error_condition_exp: error.to_string(),
            error_action: Some(ErrorAction::Pause),
            ..Default::default()
        }
    }
}

// ── Action ledger ─────────────────────────────────────────────────

/// Status of a deployment action for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Created but not yet sent to the target.
    Scheduled,
    /// In flight on the device (download, install, warning, ...).
    Running,
    Finished,
    Error,
    Canceling,
    Canceled,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Finished | ActionStatus::Error | ActionStatus::Canceled
        )
    }

    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        match self {
            Scheduled => matches!(next, Running | Canceled),
            Running => matches!(next, Running | Finished | Error | Canceling),
            Canceling => matches!(next, Canceled | Finished | Error),
            Finished | Error | Canceled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Scheduled => "scheduled",
            ActionStatus::Running => "running",
            ActionStatus::Finished => "finished",
            ActionStatus::Error => "error",
            ActionStatus::Canceling => "canceling",
            ActionStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment instruction for one target within one rollout group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: u64,
    pub rollout_id: RolloutId,
    pub group_id: GroupId,
    pub target_id: TargetId,
    pub bundle_id: BundleId,
    pub status: ActionStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Drafts ────────────────────────────────────────────────────────

/// Input for [`crate::StateStore::insert_rollout`]; ids, versions and
/// timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct RolloutDraft {
    pub name: String,
    pub description: Option<String>,
    pub bundle_id: BundleId,
    pub target_query: String,
    pub conditions: GroupConditions,
    pub start_at: Option<u64>,
}

/// One group of a [`RolloutDraft`] with its resolved members.
#[derive(Debug, Clone)]
pub struct GroupDraft {
    pub name: String,
    pub target_percentage: f32,
    pub conditions: GroupConditions,
    pub members: Vec<TargetId>,
}

impl RolloutGroup {
    /// Build the composite key for the groups table.
    pub fn table_key(&self) -> String {
        crate::tables::group_key(self.rollout_id, self.ordinal)
    }
}

impl Action {
    /// Build the composite key for the actions table.
    pub fn table_key(&self) -> String {
        crate::tables::target_key(self.rollout_id, self.group_id, &self.target_id)
    }
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_status_is_monotonic() {
        assert!(GroupStatus::Scheduled.can_transition_to(GroupStatus::Running));
        assert!(GroupStatus::Scheduled.can_transition_to(GroupStatus::Finished));
        assert!(GroupStatus::Running.can_transition_to(GroupStatus::Error));
        assert!(!GroupStatus::Running.can_transition_to(GroupStatus::Scheduled));
        assert!(!GroupStatus::Finished.can_transition_to(GroupStatus::Error));
        assert!(GroupStatus::Finished.can_transition_to(GroupStatus::Finished));
    }

    #[test]
    fn terminal_actions_are_write_once() {
        for status in [ActionStatus::Finished, ActionStatus::Error, ActionStatus::Canceled] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(ActionStatus::Running));
            assert!(!status.can_transition_to(status));
        }
        assert!(ActionStatus::Scheduled.can_transition_to(ActionStatus::Running));
        assert!(!ActionStatus::Scheduled.can_transition_to(ActionStatus::Finished));
    }

    #[test]
    fn tags_serialize_snake_case() {
        let json = serde_json::to_string(&SuccessAction::NextGroup).unwrap();
        assert_eq!(json, "\"next_group\"");
        assert_eq!(SuccessAction::NextGroup.tag(), "next_group");
        assert_eq!(SuccessAction::ALL.len(), 2);
    }
}
