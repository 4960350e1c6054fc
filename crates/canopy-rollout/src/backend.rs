//! Collaborator interfaces the engine consumes, and their redb-backed
//! implementation.
//!
//! Evaluators only see these traits, so they can be driven against any
//! store that upholds the same guarantees: committed-only reads of the
//! action ledger and version-checked saves of rollouts and groups.

use canopy_state::{
    ActionStatus, GroupId, Rollout, RolloutGroup, RolloutId, RolloutStatus, StateStore,
};
use tracing::{debug, info};

use crate::authority::ExecContext;
use crate::error::{EngineError, EngineResult};

/// Rollout and group persistence.
pub trait RolloutRepository: Send + Sync {
    fn get_rollout(&self, id: RolloutId) -> EngineResult<Rollout>;
    /// Groups in execution order.
    fn list_groups(&self, rollout: RolloutId) -> EngineResult<Vec<RolloutGroup>>;
    fn get_group(&self, rollout: RolloutId, group: GroupId) -> EngineResult<RolloutGroup>;
    fn save_rollout(&self, ctx: &ExecContext, rollout: &Rollout) -> EngineResult<Rollout>;
    fn save_group(&self, ctx: &ExecContext, group: &RolloutGroup) -> EngineResult<RolloutGroup>;
    /// Move a RUNNING rollout to PAUSED. A PAUSED rollout is returned as is.
    fn pause_rollout(&self, ctx: &ExecContext, id: RolloutId) -> EngineResult<Rollout>;
}

/// Aggregate queries over the action ledger. Reflects committed writes only.
pub trait ActionLedger: Send + Sync {
    fn count_by_status(
        &self,
        rollout: RolloutId,
        group: GroupId,
        status: ActionStatus,
    ) -> EngineResult<u64>;

    fn count_all(&self, rollout: RolloutId, group: GroupId) -> EngineResult<u64>;
}

/// Activates scheduled actions.
pub trait ActionScheduler: Send + Sync {
    /// Start the SCHEDULED actions for `bundle` in the group whose parent
    /// is `parent` (the first group when `None`). Returns how many started.
    fn start_scheduled_actions(
        &self,
        rollout: RolloutId,
        bundle: &str,
        parent: Option<GroupId>,
    ) -> EngineResult<u64>;
}

/// All three collaborators over one [`StateStore`].
#[derive(Clone)]
pub struct StoreBackend {
    store: StateStore,
    batch_size: usize,
}

impl StoreBackend {
    pub fn new(store: StateStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl RolloutRepository for StoreBackend {
    fn get_rollout(&self, id: RolloutId) -> EngineResult<Rollout> {
        self.store
            .get_rollout(id)?
            .ok_or_else(|| EngineError::NotFound(format!("rollout {id}")))
    }

    fn list_groups(&self, rollout: RolloutId) -> EngineResult<Vec<RolloutGroup>> {
        Ok(self.store.list_groups(rollout)?)
    }

    fn get_group(&self, rollout: RolloutId, group: GroupId) -> EngineResult<RolloutGroup> {
        self.store
            .get_group(rollout, group)?
            .ok_or_else(|| EngineError::NotFound(format!("group {group} of rollout {rollout}")))
    }

    fn save_rollout(&self, ctx: &ExecContext, rollout: &Rollout) -> EngineResult<Rollout> {
        ctx.require_rollout_management("save rollout")?;
        Ok(self.store.save_rollout(rollout)?)
    }

    fn save_group(&self, ctx: &ExecContext, group: &RolloutGroup) -> EngineResult<RolloutGroup> {
        ctx.require_rollout_management("save rollout group")?;
        Ok(self.store.save_group(group)?)
    }

    fn pause_rollout(&self, ctx: &ExecContext, id: RolloutId) -> EngineResult<Rollout> {
        ctx.require_rollout_management("pause rollout")?;
        let mut rollout = self.get_rollout(id)?;
        match rollout.status {
            RolloutStatus::Paused => {
                debug!(rollout = id, "rollout already paused");
                Ok(rollout)
            }
            RolloutStatus::Running => {
                rollout.status = RolloutStatus::Paused;
                let saved = self.store.save_rollout(&rollout)?;
                info!(rollout = id, by = ctx.principal(), "rollout paused");
                Ok(saved)
            }
            status => Err(EngineError::IllegalState {
                rollout: id,
                status,
                operation: "pause",
            }),
        }
    }
}

impl ActionLedger for StoreBackend {
    fn count_by_status(
        &self,
        rollout: RolloutId,
        group: GroupId,
        status: ActionStatus,
    ) -> EngineResult<u64> {
        Ok(self.store.count_actions(rollout, group, Some(status))?)
    }

    fn count_all(&self, rollout: RolloutId, group: GroupId) -> EngineResult<u64> {
        Ok(self.store.count_actions(rollout, group, None)?)
    }
}

impl ActionScheduler for StoreBackend {
    fn start_scheduled_actions(
        &self,
        rollout: RolloutId,
        bundle: &str,
        parent: Option<GroupId>,
    ) -> EngineResult<u64> {
        Ok(self
            .store
            .start_scheduled_actions(rollout, bundle, parent, self.batch_size)?)
    }
}
