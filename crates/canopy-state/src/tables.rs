//! redb table definitions for the Canopy state store.
//!
//! String keys are built from zero-padded numeric ids so lexical order
//! matches numeric order and a `{rollout}:` prefix scan returns a rollout's
//! records grouped and ordered.

use redb::TableDefinition;

use crate::types::{GroupId, RolloutId};

/// Store-wide counters (`next_id`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Rollouts keyed by id.
pub const ROLLOUTS: TableDefinition<u64, &[u8]> = TableDefinition::new("rollouts");

/// Rollout groups keyed by `{rollout}:{ordinal}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Group membership keyed by `{rollout}:{group}:{target}`; value is the
/// target's position in the rollout's membership list.
pub const MEMBERS: TableDefinition<&str, u64> = TableDefinition::new("members");

/// Deployment actions keyed by `{rollout}:{group}:{target}`.
pub const ACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("actions");

/// Key of the id sequence in [`META`].
pub const NEXT_ID: &str = "next_id";

/// Prefix shared by every record of a rollout.
pub fn rollout_prefix(rollout: RolloutId) -> String {
    format!("{rollout:020}:")
}

/// Prefix shared by every member/action of one group.
pub fn group_prefix(rollout: RolloutId, group: GroupId) -> String {
    format!("{rollout:020}:{group:020}:")
}

pub fn group_key(rollout: RolloutId, ordinal: u32) -> String {
    format!("{rollout:020}:{ordinal:06}")
}

pub fn target_key(rollout: RolloutId, group: GroupId, target: &str) -> String {
    format!("{rollout:020}:{group:020}:{target}")
}
