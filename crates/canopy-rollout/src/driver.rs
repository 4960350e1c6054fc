//! Rollout driver — the recurring sweep over in-progress rollouts.
//!
//! A sweep walks the stages in a fixed order so that a rollout can move
//! through several of them in one sweep:
//!
//! 1. CREATING  → materialize actions, READY
//! 2. READY     → auto-start when `start_at` has passed
//! 3. STARTING  → activate the first group, RUNNING
//! 4. RUNNING   → evaluation pass over the active group
//! 5. DELETING  → remove or soft-delete
//!
//! Every rollout is handled under its pass lock and in isolation: a failure
//! is logged and reported, never propagated to the rest of the sweep.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use canopy_core::DriverConfig;
use canopy_state::{
    ActionStatus, GroupStatus, Rollout, RolloutGroup, RolloutId, RolloutStatus, epoch_secs,
};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionOutcome, Advance, advance_from};
use crate::authority::{ExecContext, run_with_elevated_authority};
use crate::backend::{ActionLedger, ActionScheduler, RolloutRepository};
use crate::error::{EngineError, EngineResult};
use crate::locks::PassLocks;
use crate::manager::{Deletion, RolloutManager};

/// One step of the sweep, keyed by the rollout status it handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Materialize,
    AutoStart,
    Activate,
    Evaluate,
    Delete,
}

impl Stage {
    /// Sweep order.
    pub const ORDER: [Stage; 5] = [
        Stage::Materialize,
        Stage::AutoStart,
        Stage::Activate,
        Stage::Evaluate,
        Stage::Delete,
    ];

    pub fn status(&self) -> RolloutStatus {
        match self {
            Stage::Materialize => RolloutStatus::Creating,
            Stage::AutoStart => RolloutStatus::Ready,
            Stage::Activate => RolloutStatus::Starting,
            Stage::Evaluate => RolloutStatus::Running,
            Stage::Delete => RolloutStatus::Deleting,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Materialize => "materialize",
            Stage::AutoStart => "auto_start",
            Stage::Activate => "activate",
            Stage::Evaluate => "evaluate",
            Stage::Delete => "delete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// No condition holds; nothing changed.
    Idle,
    ErrorAction(ActionOutcome),
    SuccessAction(ActionOutcome),
    /// No group was running; advanced from the last settled group.
    Resumed(Advance),
    Finished,
    NotRunning,
    /// More than one group was running; the rollout was moved to ERROR.
    Halted,
}

/// Result of processing one rollout in one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Materialized { actions: u64 },
    AutoStarted,
    NotDue,
    Activated(Advance),
    Evaluated(PassOutcome),
    Deleted(Deletion),
    /// Locked by another pass, or no longer in the stage's status.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SweepFailure {
    /// `None` when listing the stage's rollouts failed.
    pub rollout: Option<RolloutId>,
    pub stage: Stage,
    pub error: String,
    pub configuration: bool,
    pub retryable: bool,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub steps: Vec<(RolloutId, Stage, StepOutcome)>,
    pub skipped: Vec<RolloutId>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    /// Outcomes recorded for `rollout`, in sweep order.
    pub fn outcomes(&self, rollout: RolloutId) -> Vec<&StepOutcome> {
        self.steps
            .iter()
            .filter(|(id, _, _)| *id == rollout)
            .map(|(_, _, outcome)| outcome)
            .collect()
    }

    pub fn failed(&self, rollout: RolloutId) -> bool {
        self.failures.iter().any(|f| f.rollout == Some(rollout))
    }

    fn record(&mut self, stage: Stage, rollout: RolloutId, result: EngineResult<StepOutcome>) {
        match result {
            Ok(StepOutcome::Skipped) => self.skipped.push(rollout),
            Ok(outcome) => self.steps.push((rollout, stage, outcome)),
            Err(e) => {
                log_failure(stage, Some(rollout), &e);
                self.failures.push(SweepFailure {
                    rollout: Some(rollout),
                    stage,
                    error: e.to_string(),
                    configuration: e.is_configuration(),
                    retryable: e.is_retryable(),
                });
            }
        }
    }

    fn record_listing_failure(&mut self, stage: Stage, e: &EngineError) {
        log_failure(stage, None, e);
        self.failures.push(SweepFailure {
            rollout: None,
            stage,
            error: e.to_string(),
            configuration: e.is_configuration(),
            retryable: e.is_retryable(),
        });
    }

    fn log_summary(&self) {
        if self.steps.is_empty() && self.failures.is_empty() {
            debug!(skipped = self.skipped.len(), "sweep complete, nothing to do");
        } else {
            info!(
                steps = self.steps.len(),
                skipped = self.skipped.len(),
                failures = self.failures.len(),
                "sweep complete"
            );
        }
    }
}

fn log_failure(stage: Stage, rollout: Option<RolloutId>, e: &EngineError) {
    if e.is_configuration() {
        error!(?rollout, %stage, error = %e, "rollout misconfigured; leaving status unchanged");
    } else if e.is_retryable() {
        warn!(?rollout, %stage, error = %e, "will retry on next sweep");
    } else {
        error!(?rollout, %stage, error = %e, "rollout pass failed");
    }
}

pub struct RolloutDriver {
    manager: Arc<RolloutManager>,
    config: DriverConfig,
    /// Context sweep passes are triggered under.
    ctx: ExecContext,
}

impl RolloutDriver {
    pub fn new(manager: Arc<RolloutManager>, config: DriverConfig) -> Self {
        Self {
            manager,
            config,
            ctx: ExecContext::system(),
        }
    }

    pub fn manager(&self) -> &RolloutManager {
        &self.manager
    }

    pub fn locks(&self) -> &PassLocks {
        self.manager.locks()
    }

    // ── Sweep ──────────────────────────────────────────────────────

    /// Rollouts currently in the stage's status.
    fn candidates(&self, stage: Stage) -> EngineResult<Vec<RolloutId>> {
        Ok(self
            .manager
            .backend()
            .store()
            .list_rollouts_by_status(stage.status())?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    /// Run every stage once, one rollout at a time.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for stage in Stage::ORDER {
            let ids = match self.candidates(stage) {
                Ok(ids) => ids,
                Err(e) => {
                    report.record_listing_failure(stage, &e);
                    continue;
                }
            };
            for id in ids {
                report.record(stage, id, self.process(stage, id));
            }
        }
        report
    }

    /// Run every stage once, with up to `permits` rollouts in flight on
    /// blocking tasks. Stages still run one after another.
    async fn sweep_concurrent(self: &Arc<Self>, permits: &Arc<Semaphore>) -> SweepReport {
        let mut report = SweepReport::default();
        for stage in Stage::ORDER {
            let driver = Arc::clone(self);
            let ids = match tokio::task::spawn_blocking(move || driver.candidates(stage)).await {
                Ok(Ok(ids)) => ids,
                Ok(Err(e)) => {
                    report.record_listing_failure(stage, &e);
                    continue;
                }
                Err(e) => {
                    error!(%stage, error = %e, "listing task failed");
                    continue;
                }
            };

            let mut tasks = JoinSet::new();
            for id in ids {
                let Ok(permit) = Arc::clone(permits).acquire_owned().await else {
                    break;
                };
                let driver = Arc::clone(self);
                tasks.spawn_blocking(move || {
                    let _permit = permit;
                    (id, driver.process(stage, id))
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((id, result)) => report.record(stage, id, result),
                    Err(e) => error!(%stage, error = %e, "rollout pass panicked"),
                }
            }
        }
        report
    }

    /// Repeat the sweep every `sweep_interval_secs` until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("rollout driver disabled");
            return;
        }

        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_passes.max(1)));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = period.as_secs(),
            max_concurrent_passes = self.config.max_concurrent_passes,
            "rollout driver started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep_concurrent(&permits).await;
                    report.log_summary();
                }
                _ = shutdown.changed() => {
                    info!("rollout driver shutting down");
                    break;
                }
            }
        }
    }

    // ── Per-rollout processing ─────────────────────────────────────

    /// Process one rollout for `stage` under its pass lock.
    pub fn process(&self, stage: Stage, id: RolloutId) -> EngineResult<StepOutcome> {
        self.process_as(&self.ctx, stage, id)
    }

    /// As [`process`](Self::process), triggered by `caller`.
    pub fn process_as(
        &self,
        caller: &ExecContext,
        stage: Stage,
        id: RolloutId,
    ) -> EngineResult<StepOutcome> {
        let Some(_guard) = self.locks().try_acquire(id) else {
            debug!(rollout = id, %stage, "pass in flight, skipping");
            return Ok(StepOutcome::Skipped);
        };

        let status = self.manager.get(id)?.status;
        if status != stage.status() {
            debug!(rollout = id, %stage, %status, "rollout moved on, skipping");
            return Ok(StepOutcome::Skipped);
        }

        match stage {
            Stage::Materialize => self
                .manager
                .materialize(id)
                .map(|actions| StepOutcome::Materialized { actions }),
            Stage::AutoStart => Ok(if self.manager.auto_start(id, epoch_secs())? {
                StepOutcome::AutoStarted
            } else {
                StepOutcome::NotDue
            }),
            Stage::Activate => self.manager.activate(id).map(StepOutcome::Activated),
            Stage::Evaluate => self.evaluate(caller, id).map(StepOutcome::Evaluated),
            Stage::Delete => self.manager.finalize_deletion(id).map(StepOutcome::Deleted),
        }
    }

    /// One evaluation pass over a RUNNING rollout.
    ///
    /// Callers must hold the rollout's pass lock.
    pub fn evaluate(&self, caller: &ExecContext, id: RolloutId) -> EngineResult<PassOutcome> {
        let backend = self.manager.backend().as_ref();
        let rollout = backend.get_rollout(id)?;
        if rollout.status != RolloutStatus::Running {
            return Ok(PassOutcome::NotRunning);
        }

        let groups = backend.list_groups(id)?;
        let running: Vec<&RolloutGroup> = groups
            .iter()
            .filter(|g| g.status == GroupStatus::Running)
            .collect();
        let group = match running.as_slice() {
            [] => return self.advance_idle(caller, &rollout, &groups),
            [group] => *group,
            _ => return self.halt(caller, &rollout, running.len()),
        };

        let stranded = backend.count_by_status(id, group.id, ActionStatus::Scheduled)?;
        if stranded > 0 {
            let started = backend.start_scheduled_actions(id, &rollout.bundle_id, group.parent)?;
            debug!(rollout = id, group = group.id, stranded, started, "re-activated stranded actions");
        }

        self.check_conditions(caller, &rollout, group)
    }

    /// Error condition first; success only if the error condition did not fire.
    fn check_conditions(
        &self,
        caller: &ExecContext,
        rollout: &Rollout,
        group: &RolloutGroup,
    ) -> EngineResult<PassOutcome> {
        let registry = self.manager.registry();
        let elevation = self.manager.elevation();
        let conditions = &group.conditions;

        if let Some(tag) = conditions.error_condition {
            let condition = registry.error_condition(tag)?;
            if condition.evaluate(rollout, group, &conditions.error_condition_exp)? {
                let action_tag = conditions
                    .error_action
                    .ok_or(EngineError::MissingErrorAction { group: group.id })?;
                let action = registry.error_action(action_tag)?;
                let outcome = run_with_elevated_authority(elevation, caller, |ctx| {
                    action.execute(ctx, rollout, group, &conditions.error_action_exp)
                })?;
                warn!(
                    rollout = rollout.id,
                    group = group.id,
                    action = %action_tag,
                    ?outcome,
                    "error condition met"
                );
                return Ok(PassOutcome::ErrorAction(outcome));
            }
        }

        let condition = registry.success_condition(conditions.success_condition)?;
        if !condition.evaluate(rollout, group, &conditions.success_condition_exp)? {
            debug!(rollout = rollout.id, group = group.id, "conditions not met");
            return Ok(PassOutcome::Idle);
        }

        let action = registry.success_action(conditions.success_action)?;
        let outcome = run_with_elevated_authority(elevation, caller, |ctx| {
            let outcome = action.execute(ctx, rollout, group, &conditions.success_action_exp)?;
            self.manager.finish_if_done(ctx, rollout.id)?;
            Ok::<_, EngineError>(outcome)
        })?;
        info!(
            rollout = rollout.id,
            group = group.id,
            action = %conditions.success_action,
            ?outcome,
            "success condition met"
        );
        Ok(PassOutcome::SuccessAction(outcome))
    }

    /// No group is running: continue from the last settled group, or finish.
    fn advance_idle(
        &self,
        caller: &ExecContext,
        rollout: &Rollout,
        groups: &[RolloutGroup],
    ) -> EngineResult<PassOutcome> {
        let backend = self.manager.backend().as_ref();
        let elevation = self.manager.elevation();

        if !groups.iter().any(|g| g.status == GroupStatus::Scheduled) {
            let finished = run_with_elevated_authority(elevation, caller, |ctx| {
                self.manager.finish_if_done(ctx, rollout.id)
            })?;
            return Ok(if finished {
                PassOutcome::Finished
            } else {
                PassOutcome::NotRunning
            });
        }

        let from = groups.iter().rev().find(|g| g.status != GroupStatus::Scheduled);
        let advance = run_with_elevated_authority(elevation, caller, |ctx| {
            let advance = advance_from(backend, backend, ctx, rollout, from)?;
            self.manager.finish_if_done(ctx, rollout.id)?;
            Ok::<_, EngineError>(advance)
        })?;
        info!(
            rollout = rollout.id,
            from = ?from.map(|g| g.id),
            running = ?advance.running,
            "rollout continued"
        );
        Ok(PassOutcome::Resumed(advance))
    }

    fn halt(
        &self,
        caller: &ExecContext,
        rollout: &Rollout,
        running: usize,
    ) -> EngineResult<PassOutcome> {
        let backend = self.manager.backend().as_ref();
        let mut halted = rollout.clone();
        halted.status = RolloutStatus::Error;
        run_with_elevated_authority(self.manager.elevation(), caller, |ctx| {
            backend.save_rollout(ctx, &halted)
        })?;
        error!(rollout = rollout.id, running, "several groups running; rollout moved to error");
        Ok(PassOutcome::Halted)
    }
}
