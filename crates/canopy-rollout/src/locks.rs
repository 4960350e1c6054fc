//! Per-rollout pass locks.
//!
//! At most one pass (materialization, activation, evaluation, deletion)
//! may touch a rollout at a time. A rollout whose lock is held is skipped
//! for the current sweep rather than waited on.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use canopy_state::RolloutId;

#[derive(Clone, Default)]
pub struct PassLocks {
    held: Arc<Mutex<HashSet<RolloutId>>>,
}

impl PassLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashSet<RolloutId>> {
        // The set stays consistent even if a holder panicked.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock for `rollout`, or `None` if a pass already holds it.
    pub fn try_acquire(&self, rollout: RolloutId) -> Option<PassGuard> {
        if self.table().insert(rollout) {
            Some(PassGuard {
                locks: self.clone(),
                rollout,
            })
        } else {
            None
        }
    }
}

/// Releases the rollout's lock on drop.
pub struct PassGuard {
    locks: PassLocks,
    rollout: RolloutId,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.locks.table().remove(&self.rollout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let locks = PassLocks::new();
        let guard = locks.try_acquire(7).unwrap();
        assert!(locks.try_acquire(7).is_none());
        assert!(locks.try_acquire(8).is_some());

        drop(guard);
        assert!(locks.try_acquire(7).is_some());
    }
}
