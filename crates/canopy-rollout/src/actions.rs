//! Action evaluators — the strategies run when a group's condition fires.
//!
//! Every evaluator re-reads the rollout and group before writing and
//! treats "already in the target state" as success, so running one twice
//! (or racing an operator pause or delete) has no additional effect.

use std::sync::Arc;

use canopy_state::{GroupId, GroupStatus, Rollout, RolloutGroup, RolloutStatus};
use tracing::{debug, info};

use crate::authority::ExecContext;
use crate::backend::{ActionScheduler, RolloutRepository};
use crate::error::EngineResult;

/// Runs a strategy for a group whose condition fired.
pub trait ActionEvaluator: Send + Sync {
    fn execute(
        &self,
        ctx: &ExecContext,
        rollout: &Rollout,
        group: &RolloutGroup,
        param: &str,
    ) -> EngineResult<ActionOutcome>;
}

/// What an action evaluator did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Paused,
    /// Someone else paused the rollout first.
    AlreadyPaused,
    /// A success pause with nothing left to gate; the rollout keeps running.
    Continued,
    Advanced(Advance),
    /// The rollout left RUNNING before the action ran; nothing was written.
    Superseded(RolloutStatus),
}

/// Result of walking forward from a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advance {
    /// Groups finished on the way because nothing in them could start.
    pub skipped: Vec<GroupId>,
    /// The group left RUNNING, if any.
    pub running: Option<GroupId>,
    /// Actions started in `running`.
    pub started: u64,
}

/// Persisted status of `rollout`.
fn current_status(repo: &dyn RolloutRepository, rollout: &Rollout) -> EngineResult<RolloutStatus> {
    Ok(repo.get_rollout(rollout.id)?.status)
}

/// Whether groups of `rollout` may still be advanced.
fn still_advancing(repo: &dyn RolloutRepository, rollout: &Rollout) -> EngineResult<bool> {
    let status = current_status(repo, rollout)?;
    let advancing = matches!(status, RolloutStatus::Running | RolloutStatus::Starting);
    if !advancing {
        debug!(rollout = rollout.id, %status, "rollout no longer advancing");
    }
    Ok(advancing)
}

/// Mark `group` FINISHED if it is still RUNNING. Returns the fresh record.
fn finish_group(
    repo: &dyn RolloutRepository,
    ctx: &ExecContext,
    group: &RolloutGroup,
) -> EngineResult<RolloutGroup> {
    let mut current = repo.get_group(group.rollout_id, group.id)?;
    if current.status == GroupStatus::Running {
        current.status = GroupStatus::Finished;
        current = repo.save_group(ctx, &current)?;
        info!(rollout = current.rollout_id, group = current.id, "group finished");
    }
    Ok(current)
}

/// Pause the rollout unless it already is. Re-reads the persisted status.
fn pause_once(
    repo: &dyn RolloutRepository,
    ctx: &ExecContext,
    rollout: &Rollout,
) -> EngineResult<ActionOutcome> {
    let current = repo.get_rollout(rollout.id)?;
    if current.status == RolloutStatus::Paused {
        debug!(rollout = rollout.id, "rollout already paused");
        return Ok(ActionOutcome::AlreadyPaused);
    }
    repo.pause_rollout(ctx, rollout.id)?;
    Ok(ActionOutcome::Paused)
}

/// Walk forward from `from` (the start of the rollout when `None`).
///
/// Finishes `from` if it is still RUNNING, then activates its child. A
/// child in which no action starts is marked FINISHED and the walk
/// continues from it; the walk stops at the first child with started
/// actions, at a child that is no longer SCHEDULED, or at the end. The
/// rollout's persisted status is checked before every group write; once
/// it is neither RUNNING nor STARTING the walk stops where it is.
pub fn advance_from(
    repo: &dyn RolloutRepository,
    scheduler: &dyn ActionScheduler,
    ctx: &ExecContext,
    rollout: &Rollout,
    from: Option<&RolloutGroup>,
) -> EngineResult<Advance> {
    if !still_advancing(repo, rollout)? {
        return Ok(Advance::default());
    }
    let mut parent = match from {
        Some(group) => Some(finish_group(repo, ctx, group)?.id),
        None => None,
    };
    let groups = repo.list_groups(rollout.id)?;
    let mut advance = Advance::default();

    while let Some(next) = groups.iter().find(|g| g.parent == parent) {
        let mut next = repo.get_group(rollout.id, next.id)?;
        if next.status != GroupStatus::Scheduled {
            debug!(
                rollout = rollout.id,
                group = next.id,
                status = %next.status,
                "next group already left scheduled"
            );
            break;
        }
        if !still_advancing(repo, rollout)? {
            break;
        }

        next.status = GroupStatus::Running;
        let mut next = repo.save_group(ctx, &next)?;
        let started = scheduler.start_scheduled_actions(rollout.id, &rollout.bundle_id, parent)?;
        if started > 0 {
            info!(
                rollout = rollout.id,
                group = next.id,
                ordinal = next.ordinal,
                started,
                "group running"
            );
            advance.running = Some(next.id);
            advance.started = started;
            break;
        }

        next.status = GroupStatus::Finished;
        let next = repo.save_group(ctx, &next)?;
        info!(
            rollout = rollout.id,
            group = next.id,
            ordinal = next.ordinal,
            "no actions to start, group finished"
        );
        advance.skipped.push(next.id);
        parent = Some(next.id);
    }

    Ok(advance)
}

/// Success action `next_group`.
pub struct NextGroupAction {
    repo: Arc<dyn RolloutRepository>,
    scheduler: Arc<dyn ActionScheduler>,
}

impl NextGroupAction {
    pub fn new(repo: Arc<dyn RolloutRepository>, scheduler: Arc<dyn ActionScheduler>) -> Self {
        Self { repo, scheduler }
    }
}

impl ActionEvaluator for NextGroupAction {
    fn execute(
        &self,
        ctx: &ExecContext,
        rollout: &Rollout,
        group: &RolloutGroup,
        _param: &str,
    ) -> EngineResult<ActionOutcome> {
        let status = current_status(self.repo.as_ref(), rollout)?;
        if status != RolloutStatus::Running {
            debug!(rollout = rollout.id, %status, "rollout left running, not advancing");
            return Ok(ActionOutcome::Superseded(status));
        }
        let advance = advance_from(
            self.repo.as_ref(),
            self.scheduler.as_ref(),
            ctx,
            rollout,
            Some(group),
        )?;
        Ok(ActionOutcome::Advanced(advance))
    }
}

/// Success action `pause`: finish the group, then hold the rollout before
/// its next group.
pub struct PauseOnSuccessAction {
    repo: Arc<dyn RolloutRepository>,
}

impl PauseOnSuccessAction {
    pub fn new(repo: Arc<dyn RolloutRepository>) -> Self {
        Self { repo }
    }
}

impl ActionEvaluator for PauseOnSuccessAction {
    fn execute(
        &self,
        ctx: &ExecContext,
        rollout: &Rollout,
        group: &RolloutGroup,
        _param: &str,
    ) -> EngineResult<ActionOutcome> {
        match current_status(self.repo.as_ref(), rollout)? {
            RolloutStatus::Running => {}
            RolloutStatus::Paused => return Ok(ActionOutcome::AlreadyPaused),
            status => return Ok(ActionOutcome::Superseded(status)),
        }
        let group = finish_group(self.repo.as_ref(), ctx, group)?;
        let gated = self
            .repo
            .list_groups(rollout.id)?
            .iter()
            .any(|g| g.parent == Some(group.id) && g.status == GroupStatus::Scheduled);
        if !gated {
            debug!(rollout = rollout.id, group = group.id, "no scheduled group left to gate");
            return Ok(ActionOutcome::Continued);
        }
        pause_once(self.repo.as_ref(), ctx, rollout)
    }
}

/// Error action `pause`: mark the group ERROR and pause the rollout.
pub struct PauseOnErrorAction {
    repo: Arc<dyn RolloutRepository>,
}

impl PauseOnErrorAction {
    pub fn new(repo: Arc<dyn RolloutRepository>) -> Self {
        Self { repo }
    }
}

impl ActionEvaluator for PauseOnErrorAction {
    fn execute(
        &self,
        ctx: &ExecContext,
        rollout: &Rollout,
        group: &RolloutGroup,
        _param: &str,
    ) -> EngineResult<ActionOutcome> {
        // A paused rollout is re-evaluated after resume.
        match current_status(self.repo.as_ref(), rollout)? {
            RolloutStatus::Running => {}
            RolloutStatus::Paused => return Ok(ActionOutcome::AlreadyPaused),
            status => return Ok(ActionOutcome::Superseded(status)),
        }
        let mut current = self.repo.get_group(rollout.id, group.id)?;
        if matches!(current.status, GroupStatus::Scheduled | GroupStatus::Running) {
            current.status = GroupStatus::Error;
            self.repo.save_group(ctx, &current)?;
            info!(rollout = rollout.id, group = group.id, "group marked error");
        }
        pause_once(self.repo.as_ref(), ctx, rollout)
    }
}
