//! Rollout lifecycle — creation, materialization, operator triggers and
//! deletion.
//!
//! Operator-facing calls (`create`, `update`, `approve`, `start`,
//! `pause`, `resume`, `trigger_next_group`, `delete`) take the caller's
//! [`ExecContext`]. The remaining steps are run by the driver as the
//! system, under the pass locks held here.

use std::collections::HashSet;
use std::sync::Arc;

use canopy_state::{
    BundleId, GroupConditions, GroupDraft, GroupStatus, Rollout, RolloutDraft, RolloutGroup,
    RolloutId, RolloutStatus, StateError, TargetId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::actions::{Advance, advance_from};
use crate::authority::{AuthorityElevation, ExecContext, SystemElevation, run_with_elevated_authority};
use crate::backend::{RolloutRepository, StoreBackend};
use crate::error::{EngineError, EngineResult};
use crate::locks::PassLocks;
use crate::registry::EvaluatorRegistry;

/// Upper bound on groups per rollout.
pub const MAX_GROUPS: usize = 500;

/// Request to create a rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub bundle_id: BundleId,
    #[serde(default)]
    pub target_query: String,
    /// Defaults for groups without their own conditions.
    #[serde(default)]
    pub conditions: GroupConditions,
    #[serde(default)]
    pub start_at: Option<u64>,
    pub groups: GroupPlan,
}

/// How the targets are split into groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPlan {
    /// This many groups of equal share.
    Amount(u32),
    Explicit(Vec<GroupDefinition>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub name: String,
    /// Percentage of the targets not assigned to earlier groups.
    pub target_percentage: f32,
    #[serde(default)]
    pub conditions: Option<GroupConditions>,
}

/// Changes to a rollout's descriptive fields. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

/// What became of a DELETING rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// No group ever ran; every record was removed.
    Removed,
    /// Marked DELETED with its history kept.
    SoftDeleted,
}

/// Resolve a plan into concrete group definitions.
fn plan_groups(plan: &GroupPlan) -> EngineResult<Vec<GroupDefinition>> {
    let definitions = match plan {
        GroupPlan::Amount(amount) => {
            let amount = *amount as usize;
            (0..amount)
                .map(|i| GroupDefinition {
                    name: format!("group-{}", i + 1),
                    target_percentage: 100.0 / (amount - i) as f32,
                    conditions: None,
                })
                .collect()
        }
        GroupPlan::Explicit(definitions) => definitions.clone(),
    };

    if definitions.is_empty() || definitions.len() > MAX_GROUPS {
        return Err(EngineError::Invalid(format!(
            "group count must be between 1 and {MAX_GROUPS}, got {}",
            definitions.len()
        )));
    }
    for group in &definitions {
        if group.name.trim().is_empty() {
            return Err(EngineError::Invalid("group name must not be empty".to_string()));
        }
        if !(group.target_percentage > 0.0 && group.target_percentage <= 100.0) {
            return Err(EngineError::Invalid(format!(
                "group '{}' target percentage must be in (0, 100], got {}",
                group.name, group.target_percentage
            )));
        }
    }
    Ok(definitions)
}

/// Split `targets` in order: each group takes its percentage of the
/// targets still unassigned, rounded; the last group takes the rest.
pub fn split_targets(targets: Vec<TargetId>, percentages: &[f32]) -> Vec<Vec<TargetId>> {
    let mut remaining = targets.into_iter();
    let mut left = remaining.len();
    let mut groups = Vec::with_capacity(percentages.len());

    for (i, percentage) in percentages.iter().enumerate() {
        let take = if i + 1 == percentages.len() {
            left
        } else {
            let share = (f64::from(*percentage) / 100.0 * left as f64).round() as usize;
            share.min(left)
        };
        groups.push(remaining.by_ref().take(take).collect::<Vec<_>>());
        left -= take;
    }
    groups
}

fn dedup_targets(targets: Vec<TargetId>) -> Vec<TargetId> {
    let mut seen = HashSet::with_capacity(targets.len());
    targets
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

pub struct RolloutManager {
    backend: Arc<StoreBackend>,
    registry: Arc<EvaluatorRegistry>,
    elevation: Arc<dyn AuthorityElevation>,
    locks: PassLocks,
    /// Materialized rollouts wait for approval instead of going READY.
    require_approval: bool,
}

impl RolloutManager {
    pub fn new(backend: Arc<StoreBackend>, registry: Arc<EvaluatorRegistry>) -> Self {
        Self {
            backend,
            registry,
            elevation: Arc::new(SystemElevation),
            locks: PassLocks::new(),
            require_approval: false,
        }
    }

    pub fn with_elevation(mut self, elevation: Arc<dyn AuthorityElevation>) -> Self {
        self.elevation = elevation;
        self
    }

    pub fn with_approval(mut self, required: bool) -> Self {
        self.require_approval = required;
        self
    }

    pub fn backend(&self) -> &Arc<StoreBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &EvaluatorRegistry {
        &self.registry
    }

    pub fn elevation(&self) -> &dyn AuthorityElevation {
        self.elevation.as_ref()
    }

    /// Per-rollout pass locks shared with the driver.
    pub fn locks(&self) -> &PassLocks {
        &self.locks
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, id: RolloutId) -> EngineResult<Rollout> {
        self.backend.get_rollout(id)
    }

    pub fn groups(&self, id: RolloutId) -> EngineResult<Vec<RolloutGroup>> {
        self.backend.list_groups(id)
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Validate and persist a new rollout in CREATING.
    pub fn create(
        &self,
        ctx: &ExecContext,
        request: RolloutCreate,
        targets: Vec<TargetId>,
    ) -> EngineResult<(Rollout, Vec<RolloutGroup>)> {
        ctx.require_rollout_management("create rollout")?;

        if request.name.trim().is_empty() {
            return Err(EngineError::Invalid("rollout name must not be empty".to_string()));
        }
        if request.bundle_id.trim().is_empty() {
            return Err(EngineError::Invalid("bundle id must not be empty".to_string()));
        }
        let targets = dedup_targets(targets);
        if targets.is_empty() {
            return Err(EngineError::Invalid(format!(
                "rollout '{}' matches no targets",
                request.name
            )));
        }

        let definitions = plan_groups(&request.groups)?;
        self.registry.verify(&request.conditions)?;
        for definition in &definitions {
            if let Some(conditions) = &definition.conditions {
                self.registry.verify(conditions)?;
            }
        }

        let percentages: Vec<f32> = definitions.iter().map(|d| d.target_percentage).collect();
        let members = split_targets(targets, &percentages);
        let drafts = definitions
            .into_iter()
            .zip(members)
            .map(|(definition, members)| GroupDraft {
                name: definition.name,
                target_percentage: definition.target_percentage,
                conditions: definition
                    .conditions
                    .unwrap_or_else(|| request.conditions.clone()),
                members,
            })
            .collect();

        let draft = RolloutDraft {
            name: request.name,
            description: request.description,
            bundle_id: request.bundle_id,
            target_query: request.target_query,
            conditions: request.conditions,
            start_at: request.start_at,
        };
        let (rollout, groups) = self
            .backend
            .store()
            .insert_rollout(draft, drafts)
            .map_err(|e| match e {
                StateError::Constraint(reason) => EngineError::Invalid(reason),
                other => EngineError::State(other),
            })?;

        info!(
            rollout = rollout.id,
            name = %rollout.name,
            groups = groups.len(),
            targets = rollout.total_targets,
            by = ctx.principal(),
            "rollout created"
        );
        Ok((rollout, groups))
    }

    /// Create the SCHEDULED actions of a CREATING rollout and move it to
    /// READY, or to WAITING_FOR_APPROVAL when approval is required.
    /// Returns the number of actions created.
    pub fn materialize(&self, id: RolloutId) -> EngineResult<u64> {
        let mut rollout = self.expect_status(id, RolloutStatus::Creating, "materialize")?;
        let store = self.backend.store();
        let batch = self.backend.batch_size();

        let mut created = 0;
        for group in self.backend.list_groups(id)? {
            loop {
                let n = store.create_missing_actions(&rollout, &group, batch)?;
                if n == 0 {
                    break;
                }
                created += n;
            }
        }

        rollout.status = if self.require_approval {
            RolloutStatus::WaitingForApproval
        } else {
            RolloutStatus::Ready
        };
        self.backend.save_rollout(&ExecContext::system(), &rollout)?;
        info!(rollout = id, actions = created, status = %rollout.status, "rollout materialized");
        Ok(created)
    }

    // ── Operator triggers ──────────────────────────────────────────

    /// Rename or re-describe a rollout that is not being deleted.
    pub fn update(
        &self,
        ctx: &ExecContext,
        id: RolloutId,
        update: RolloutUpdate,
    ) -> EngineResult<Rollout> {
        ctx.require_rollout_management("update rollout")?;
        let mut rollout = self.backend.get_rollout(id)?;
        if matches!(rollout.status, RolloutStatus::Deleting | RolloutStatus::Deleted) {
            return Err(EngineError::IllegalState {
                rollout: id,
                status: rollout.status,
                operation: "update",
            });
        }

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(EngineError::Invalid("rollout name must not be empty".to_string()));
            }
            let taken = self
                .backend
                .store()
                .list_rollouts()?
                .iter()
                .any(|r| r.id != id && !r.deleted && r.name == name);
            if taken {
                return Err(EngineError::Invalid(format!(
                    "rollout named '{name}' already exists"
                )));
            }
            rollout.name = name;
        }
        if let Some(description) = update.description {
            rollout.description = Some(description);
        }

        let saved = self.backend.save_rollout(ctx, &rollout)?;
        info!(rollout = id, name = %saved.name, by = ctx.principal(), "rollout updated");
        Ok(saved)
    }

    /// WAITING_FOR_APPROVAL → READY or APPROVAL_DENIED.
    pub fn approve(
        &self,
        ctx: &ExecContext,
        id: RolloutId,
        decision: ApprovalDecision,
        remark: Option<String>,
    ) -> EngineResult<Rollout> {
        ctx.require_rollout_approval("approve rollout")?;
        let mut rollout = self.expect_status(id, RolloutStatus::WaitingForApproval, "approve")?;
        rollout.status = match decision {
            ApprovalDecision::Approved => RolloutStatus::Ready,
            ApprovalDecision::Denied => RolloutStatus::ApprovalDenied,
        };
        rollout.approval_decided_by = Some(ctx.principal().to_string());
        if remark.is_some() {
            rollout.approval_remark = remark;
        }
        let saved = self.backend.save_rollout(ctx, &rollout)?;
        info!(rollout = id, ?decision, by = ctx.principal(), "rollout approval decided");
        Ok(saved)
    }

    /// READY → STARTING.
    pub fn start(&self, ctx: &ExecContext, id: RolloutId) -> EngineResult<Rollout> {
        ctx.require_rollout_management("start rollout")?;
        let mut rollout = self.expect_status(id, RolloutStatus::Ready, "start")?;
        rollout.status = RolloutStatus::Starting;
        let saved = self.backend.save_rollout(ctx, &rollout)?;
        info!(rollout = id, by = ctx.principal(), "rollout starting");
        Ok(saved)
    }

    /// RUNNING → PAUSED. Pausing a paused rollout is a no-op.
    pub fn pause(&self, ctx: &ExecContext, id: RolloutId) -> EngineResult<Rollout> {
        ctx.require_rollout_management("pause rollout")?;
        self.backend.pause_rollout(ctx, id)
    }

    /// PAUSED → RUNNING. The next pass picks up where the rollout stopped.
    pub fn resume(&self, ctx: &ExecContext, id: RolloutId) -> EngineResult<Rollout> {
        ctx.require_rollout_management("resume rollout")?;
        let mut rollout = self.expect_status(id, RolloutStatus::Paused, "resume")?;
        rollout.status = RolloutStatus::Running;
        let saved = self.backend.save_rollout(ctx, &rollout)?;
        info!(rollout = id, by = ctx.principal(), "rollout resumed");
        Ok(saved)
    }

    /// Advance a RUNNING rollout past its latest running group now,
    /// without waiting for the group's success condition.
    pub fn trigger_next_group(&self, ctx: &ExecContext, id: RolloutId) -> EngineResult<Advance> {
        ctx.require_rollout_management("trigger next group")?;
        let Some(_guard) = self.locks.try_acquire(id) else {
            return Err(EngineError::PassInFlight(id));
        };
        let rollout = self.expect_status(id, RolloutStatus::Running, "trigger next group")?;

        let groups = self.backend.list_groups(id)?;
        if !groups.iter().any(|g| g.status == GroupStatus::Scheduled) {
            return Err(EngineError::Invalid(format!(
                "rollout {id} has no scheduled group left to trigger"
            )));
        }
        let latest = groups
            .iter()
            .rev()
            .find(|g| g.status == GroupStatus::Running)
            .ok_or_else(|| EngineError::Invalid(format!("rollout {id} has no running group")))?;

        let advance = advance_from(
            self.backend.as_ref(),
            self.backend.as_ref(),
            ctx,
            &rollout,
            Some(latest),
        )?;
        self.finish_if_done(ctx, id)?;
        info!(
            rollout = id,
            from = latest.id,
            running = ?advance.running,
            by = ctx.principal(),
            "next group triggered"
        );
        Ok(advance)
    }

    /// Request deletion. Records are removed by the next sweep.
    pub fn delete(&self, ctx: &ExecContext, id: RolloutId) -> EngineResult<Rollout> {
        ctx.require_rollout_management("delete rollout")?;
        let mut rollout = self.backend.get_rollout(id)?;
        match rollout.status {
            RolloutStatus::Deleting => Ok(rollout),
            RolloutStatus::Deleted => Err(EngineError::IllegalState {
                rollout: id,
                status: rollout.status,
                operation: "delete",
            }),
            _ => {
                rollout.status = RolloutStatus::Deleting;
                let saved = self.backend.save_rollout(ctx, &rollout)?;
                info!(rollout = id, by = ctx.principal(), "rollout marked for deletion");
                Ok(saved)
            }
        }
    }

    // ── Driver steps ───────────────────────────────────────────────

    /// Move a READY rollout whose start time has come to STARTING.
    pub fn auto_start(&self, id: RolloutId, now: u64) -> EngineResult<bool> {
        let mut rollout = self.expect_status(id, RolloutStatus::Ready, "auto-start")?;
        match rollout.start_at {
            Some(at) if at <= now => {
                rollout.status = RolloutStatus::Starting;
                self.backend.save_rollout(&ExecContext::system(), &rollout)?;
                info!(rollout = id, start_at = at, "rollout auto-started");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Activate the first group of a STARTING rollout, then mark it RUNNING.
    ///
    /// A rollout that left STARTING meanwhile (deleted by an operator) is
    /// left in its new status.
    pub fn activate(&self, id: RolloutId) -> EngineResult<Advance> {
        let rollout = self.expect_status(id, RolloutStatus::Starting, "activate")?;
        let system = ExecContext::system();
        let advance = run_with_elevated_authority(self.elevation(), &system, |ctx| {
            advance_from(
                self.backend.as_ref(),
                self.backend.as_ref(),
                ctx,
                &rollout,
                None,
            )
        })?;

        let mut rollout = self.backend.get_rollout(id)?;
        if rollout.status != RolloutStatus::Starting {
            info!(rollout = id, status = %rollout.status, "rollout changed during activation");
            return Ok(advance);
        }
        rollout.status = RolloutStatus::Running;
        self.backend.save_rollout(&system, &rollout)?;
        info!(
            rollout = id,
            group = ?advance.running,
            skipped = advance.skipped.len(),
            "rollout running"
        );
        Ok(advance)
    }

    /// Mark a RUNNING rollout FINISHED once no group is RUNNING or SCHEDULED.
    pub fn finish_if_done(&self, ctx: &ExecContext, id: RolloutId) -> EngineResult<bool> {
        let mut rollout = self.backend.get_rollout(id)?;
        if rollout.status != RolloutStatus::Running {
            return Ok(false);
        }
        let pending = self
            .backend
            .list_groups(id)?
            .iter()
            .any(|g| matches!(g.status, GroupStatus::Running | GroupStatus::Scheduled));
        if pending {
            return Ok(false);
        }
        rollout.status = RolloutStatus::Finished;
        self.backend.save_rollout(ctx, &rollout)?;
        info!(rollout = id, "rollout finished");
        Ok(true)
    }

    /// Remove or soft-delete a DELETING rollout.
    ///
    /// Callers must hold the rollout's pass lock.
    pub fn finalize_deletion(&self, id: RolloutId) -> EngineResult<Deletion> {
        let mut rollout = self.expect_status(id, RolloutStatus::Deleting, "finalize deletion")?;
        let store = self.backend.store();
        let removed = store.delete_scheduled_actions(id)?;
        debug!(rollout = id, removed, "scheduled actions removed");

        let never_ran = self
            .backend
            .list_groups(id)?
            .iter()
            .all(|g| g.status == GroupStatus::Scheduled);
        if never_ran {
            store.delete_rollout(id)?;
            info!(rollout = id, "rollout removed");
            return Ok(Deletion::Removed);
        }

        rollout.status = RolloutStatus::Deleted;
        rollout.deleted = true;
        self.backend.save_rollout(&ExecContext::system(), &rollout)?;
        info!(rollout = id, "rollout deleted, history kept");
        Ok(Deletion::SoftDeleted)
    }

    fn expect_status(
        &self,
        id: RolloutId,
        expected: RolloutStatus,
        operation: &'static str,
    ) -> EngineResult<Rollout> {
        let rollout = self.backend.get_rollout(id)?;
        if rollout.status != expected {
            return Err(EngineError::IllegalState {
                rollout: id,
                status: rollout.status,
                operation,
            });
        }
        Ok(rollout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_state::StateStore;

    /// Marks every STARTING rollout for deletion when asked to elevate, the
    /// way an operator delete landing mid-activation would.
    struct DeleteOnElevate {
        store: StateStore,
    }

    impl AuthorityElevation for DeleteOnElevate {
        fn elevate(&self, caller: &ExecContext) -> ExecContext {
            for mut rollout in self
                .store
                .list_rollouts_by_status(RolloutStatus::Starting)
                .unwrap()
            {
                rollout.status = RolloutStatus::Deleting;
                self.store.save_rollout(&rollout).unwrap();
            }
            SystemElevation.elevate(caller)
        }
    }

    /// Created, materialized, started and activated.
    fn running(manager: &RolloutManager, name: &str, targets: usize, groups: u32) -> RolloutId {
        let ctx = ExecContext::system();
        let (rollout, _) = manager
            .create(&ctx, request(name, GroupPlan::Amount(groups)), ids(targets))
            .unwrap();
        manager.materialize(rollout.id).unwrap();
        manager.start(&ctx, rollout.id).unwrap();
        manager.activate(rollout.id).unwrap();
        rollout.id
    }

    fn statuses(manager: &RolloutManager, id: RolloutId) -> Vec<GroupStatus> {
        manager.groups(id).unwrap().iter().map(|g| g.status).collect()
    }

    fn ids(n: usize) -> Vec<TargetId> {
        (0..n).map(|i| format!("dev-{i:03}")).collect()
    }

    fn manager() -> RolloutManager {
        let backend = Arc::new(StoreBackend::new(StateStore::open_in_memory().unwrap(), 4));
        let registry = Arc::new(EvaluatorRegistry::with_defaults(backend.clone()).unwrap());
        RolloutManager::new(backend, registry)
    }

    fn request(name: &str, groups: GroupPlan) -> RolloutCreate {
        RolloutCreate {
            name: name.to_string(),
            description: None,
            bundle_id: "fw-2.1".to_string(),
            target_query: "model==x1".to_string(),
            conditions: GroupConditions::thresholds(80, 20),
            start_at: None,
            groups,
        }
    }

    #[test]
    fn equal_split_uses_remaining_share() {
        let plan = plan_groups(&GroupPlan::Amount(3)).unwrap();
        let percentages: Vec<f32> = plan.iter().map(|g| g.target_percentage).collect();
        let groups = split_targets(ids(30), &percentages);
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 10]);
        assert_eq!(groups[0][0], "dev-000");
        assert_eq!(groups[2][9], "dev-029");
    }

    #[test]
    fn last_group_takes_the_rest() {
        let groups = split_targets(ids(7), &[50.0, 50.0, 10.0]);
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        // 3.5 rounds to 4, then 50% of 3 rounds to 2, last takes 1.
        assert_eq!(sizes, vec![4, 2, 1]);
    }

    #[test]
    fn small_populations_leave_empty_groups() {
        let plan = plan_groups(&GroupPlan::Amount(3)).unwrap();
        let percentages: Vec<f32> = plan.iter().map(|g| g.target_percentage).collect();
        let sizes: Vec<usize> = split_targets(ids(1), &percentages)
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes.iter().sum::<usize>(), 1);
        assert!(sizes.contains(&0));
    }

    #[test]
    fn plan_validation() {
        assert!(plan_groups(&GroupPlan::Amount(0)).is_err());
        assert!(plan_groups(&GroupPlan::Amount(501)).is_err());
        assert_eq!(plan_groups(&GroupPlan::Amount(500)).unwrap().len(), 500);

        let bad = GroupPlan::Explicit(vec![GroupDefinition {
            name: "canary".into(),
            target_percentage: 0.0,
            conditions: None,
        }]);
        assert!(matches!(plan_groups(&bad).unwrap_err(), EngineError::Invalid(_)));
    }

    #[test]
    fn create_dedups_and_fixes_counts() {
        let manager = manager();
        let mut targets = ids(20);
        targets.extend(ids(5));
        let (rollout, groups) = manager
            .create(&ExecContext::system(), request("fw", GroupPlan::Amount(2)), targets)
            .unwrap();
        assert_eq!(rollout.status, RolloutStatus::Creating);
        assert_eq!(rollout.total_targets, 20);
        assert_eq!(groups[0].target_count + groups[1].target_count, 20);
        assert_eq!(groups[0].conditions, GroupConditions::thresholds(80, 20));
    }

    #[test]
    fn create_rejects_bad_input() {
        let manager = manager();
        let ctx = ExecContext::system();

        let err = manager
            .create(&ctx, request("fw", GroupPlan::Amount(2)), vec![])
            .unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));

        let mut bad = request("fw", GroupPlan::Amount(2));
        bad.conditions.success_condition_exp = "150".into();
        assert!(manager.create(&ctx, bad, ids(4)).unwrap_err().is_configuration());

        manager
            .create(&ctx, request("fw", GroupPlan::Amount(2)), ids(4))
            .unwrap();
        let dup = manager
            .create(&ctx, request("fw", GroupPlan::Amount(2)), ids(4))
            .unwrap_err();
        assert!(matches!(dup, EngineError::Invalid(_)));

        let denied = manager
            .create(
                &ExecContext::operator("viewer", false),
                request("other", GroupPlan::Amount(1)),
                ids(4),
            )
            .unwrap_err();
        assert!(matches!(denied, EngineError::PermissionDenied { .. }));
    }

    #[test]
    fn operator_transitions() {
        let manager = manager();
        let ctx = ExecContext::operator("ops", true);
        let (rollout, _) = manager
            .create(&ctx, request("fw", GroupPlan::Amount(2)), ids(4))
            .unwrap();

        // Not READY yet.
        let err = manager.start(&ctx, rollout.id).unwrap_err();
        assert!(matches!(err, EngineError::IllegalState { .. }));

        assert_eq!(manager.materialize(rollout.id).unwrap(), 4);
        assert_eq!(manager.start(&ctx, rollout.id).unwrap().status, RolloutStatus::Starting);

        // Only RUNNING rollouts can be paused, only PAUSED ones resumed.
        assert!(manager.pause(&ctx, rollout.id).is_err());
        assert!(manager.resume(&ctx, rollout.id).is_err());

        manager.activate(rollout.id).unwrap();
        assert_eq!(manager.pause(&ctx, rollout.id).unwrap().status, RolloutStatus::Paused);
        assert_eq!(manager.pause(&ctx, rollout.id).unwrap().status, RolloutStatus::Paused);
        assert_eq!(manager.resume(&ctx, rollout.id).unwrap().status, RolloutStatus::Running);
    }

    #[test]
    fn auto_start_respects_start_time() {
        let manager = manager();
        let mut req = request("scheduled", GroupPlan::Amount(1));
        req.start_at = Some(1_000);
        let (rollout, _) = manager.create(&ExecContext::system(), req, ids(2)).unwrap();
        manager.materialize(rollout.id).unwrap();

        assert!(!manager.auto_start(rollout.id, 999).unwrap());
        assert!(manager.auto_start(rollout.id, 1_000).unwrap());
        assert_eq!(manager.get(rollout.id).unwrap().status, RolloutStatus::Starting);
    }

    #[test]
    fn deleting_unstarted_rollout_removes_it() {
        let manager = manager();
        let ctx = ExecContext::system();
        let (rollout, _) = manager
            .create(&ctx, request("fw", GroupPlan::Amount(2)), ids(4))
            .unwrap();
        manager.materialize(rollout.id).unwrap();

        manager.delete(&ctx, rollout.id).unwrap();
        assert_eq!(manager.finalize_deletion(rollout.id).unwrap(), Deletion::Removed);
        assert!(matches!(
            manager.get(rollout.id).unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[test]
    fn deleting_started_rollout_keeps_history() {
        let manager = manager();
        let ctx = ExecContext::system();
        let (rollout, groups) = manager
            .create(&ctx, request("fw", GroupPlan::Amount(2)), ids(4))
            .unwrap();
        manager.materialize(rollout.id).unwrap();
        manager.start(&ctx, rollout.id).unwrap();
        manager.activate(rollout.id).unwrap();

        manager.delete(&ctx, rollout.id).unwrap();
        // Repeated requests are harmless.
        manager.delete(&ctx, rollout.id).unwrap();
        assert_eq!(manager.finalize_deletion(rollout.id).unwrap(), Deletion::SoftDeleted);

        let deleted = manager.get(rollout.id).unwrap();
        assert_eq!(deleted.status, RolloutStatus::Deleted);
        assert!(deleted.deleted);

        let store = manager.backend().store();
        // Started actions of group 1 survive; scheduled ones of group 2 are gone.
        assert_eq!(store.count_actions(rollout.id, groups[0].id, None).unwrap(), 2);
        assert_eq!(store.count_actions(rollout.id, groups[1].id, None).unwrap(), 0);
        assert!(manager.delete(&ctx, rollout.id).is_err());
    }

    #[test]
    fn approval_gates_start() {
        let backend = Arc::new(StoreBackend::new(StateStore::open_in_memory().unwrap(), 4));
        let registry = Arc::new(EvaluatorRegistry::with_defaults(backend.clone()).unwrap());
        let manager = RolloutManager::new(backend, registry).with_approval(true);
        let ops = ExecContext::operator("ops", true);
        let approver = ExecContext::operator("lead", true).with_rollout_approval();

        let (first, _) = manager
            .create(&ops, request("fw", GroupPlan::Amount(2)), ids(4))
            .unwrap();
        manager.materialize(first.id).unwrap();
        assert_eq!(
            manager.get(first.id).unwrap().status,
            RolloutStatus::WaitingForApproval
        );
        assert!(matches!(
            manager.start(&ops, first.id).unwrap_err(),
            EngineError::IllegalState { .. }
        ));
        assert!(matches!(
            manager
                .approve(&ops, first.id, ApprovalDecision::Approved, None)
                .unwrap_err(),
            EngineError::PermissionDenied { .. }
        ));

        let approved = manager
            .approve(&approver, first.id, ApprovalDecision::Approved, Some("ok".into()))
            .unwrap();
        assert_eq!(approved.status, RolloutStatus::Ready);
        assert_eq!(approved.approval_decided_by.as_deref(), Some("lead"));
        assert_eq!(approved.approval_remark.as_deref(), Some("ok"));
        assert_eq!(manager.start(&ops, first.id).unwrap().status, RolloutStatus::Starting);

        // A decision is only taken once.
        assert!(manager
            .approve(&approver, first.id, ApprovalDecision::Denied, None)
            .is_err());

        let (second, _) = manager
            .create(&ops, request("fw-b", GroupPlan::Amount(1)), ids(2))
            .unwrap();
        manager.materialize(second.id).unwrap();
        let denied = manager
            .approve(&approver, second.id, ApprovalDecision::Denied, None)
            .unwrap();
        assert_eq!(denied.status, RolloutStatus::ApprovalDenied);
        assert!(manager.start(&ops, second.id).is_err());
        manager.delete(&ops, second.id).unwrap();
        assert_eq!(manager.finalize_deletion(second.id).unwrap(), Deletion::Removed);
    }

    #[test]
    fn update_renames_and_describes() {
        let manager = manager();
        let ctx = ExecContext::operator("ops", true);
        let (first, _) = manager
            .create(&ctx, request("fw", GroupPlan::Amount(1)), ids(2))
            .unwrap();
        manager
            .create(&ctx, request("fw-b", GroupPlan::Amount(1)), ids(2))
            .unwrap();

        let updated = manager
            .update(
                &ctx,
                first.id,
                RolloutUpdate {
                    name: Some("fw-renamed".into()),
                    description: Some("second wave".into()),
                },
            )
            .unwrap();
        assert_eq!(updated.name, "fw-renamed");
        assert_eq!(updated.description.as_deref(), Some("second wave"));
        assert_eq!(updated.version, first.version + 1);

        let clash = RolloutUpdate {
            name: Some("fw-b".into()),
            ..Default::default()
        };
        assert!(matches!(
            manager.update(&ctx, first.id, clash).unwrap_err(),
            EngineError::Invalid(_)
        ));

        let viewer = ExecContext::operator("viewer", false);
        assert!(manager
            .update(&viewer, first.id, RolloutUpdate::default())
            .is_err());

        manager.delete(&ctx, first.id).unwrap();
        assert!(matches!(
            manager
                .update(&ctx, first.id, RolloutUpdate::default())
                .unwrap_err(),
            EngineError::IllegalState { .. }
        ));
    }

    #[test]
    fn trigger_next_group_walks_ahead_of_conditions() {
        let manager = manager();
        let ops = ExecContext::operator("ops", true);
        let id = running(&manager, "fw", 12, 3);
        assert_eq!(
            statuses(&manager, id),
            vec![GroupStatus::Running, GroupStatus::Scheduled, GroupStatus::Scheduled]
        );

        let groups = manager.groups(id).unwrap();
        let advance = manager.trigger_next_group(&ops, id).unwrap();
        assert_eq!(advance.running, Some(groups[1].id));
        assert_eq!(advance.started, 4);
        assert_eq!(
            statuses(&manager, id),
            vec![GroupStatus::Finished, GroupStatus::Running, GroupStatus::Scheduled]
        );

        // Another pass owns the rollout.
        let guard = manager.locks().try_acquire(id).unwrap();
        let busy = manager.trigger_next_group(&ops, id).unwrap_err();
        assert!(matches!(busy, EngineError::PassInFlight(_)));
        assert!(busy.is_retryable());
        drop(guard);

        manager.trigger_next_group(&ops, id).unwrap();
        assert_eq!(
            statuses(&manager, id),
            vec![GroupStatus::Finished, GroupStatus::Finished, GroupStatus::Running]
        );
        assert!(matches!(
            manager.trigger_next_group(&ops, id).unwrap_err(),
            EngineError::Invalid(_)
        ));
    }

    #[test]
    fn trigger_next_group_requires_running_rollout() {
        let manager = manager();
        let ops = ExecContext::operator("ops", true);
        let id = running(&manager, "fw", 8, 2);
        manager.pause(&ops, id).unwrap();

        assert!(matches!(
            manager.trigger_next_group(&ops, id).unwrap_err(),
            EngineError::IllegalState { .. }
        ));
        assert!(matches!(
            manager
                .trigger_next_group(&ExecContext::operator("viewer", false), id)
                .unwrap_err(),
            EngineError::PermissionDenied { .. }
        ));
        assert_eq!(
            statuses(&manager, id),
            vec![GroupStatus::Running, GroupStatus::Scheduled]
        );
    }

    #[test]
    fn delete_during_activation_is_kept() {
        let store = StateStore::open_in_memory().unwrap();
        let backend = Arc::new(StoreBackend::new(store.clone(), 4));
        let registry = Arc::new(EvaluatorRegistry::with_defaults(backend.clone()).unwrap());
        let manager = RolloutManager::new(backend, registry)
            .with_elevation(Arc::new(DeleteOnElevate { store }));
        let ctx = ExecContext::system();
        let (rollout, _) = manager
            .create(&ctx, request("fw", GroupPlan::Amount(2)), ids(4))
            .unwrap();
        manager.materialize(rollout.id).unwrap();
        manager.start(&ctx, rollout.id).unwrap();

        let advance = manager.activate(rollout.id).unwrap();
        assert_eq!(advance, Advance::default());
        assert_eq!(manager.get(rollout.id).unwrap().status, RolloutStatus::Deleting);
        assert_eq!(
            statuses(&manager, rollout.id),
            vec![GroupStatus::Scheduled, GroupStatus::Scheduled]
        );
        assert_eq!(manager.finalize_deletion(rollout.id).unwrap(), Deletion::Removed);
    }
}
