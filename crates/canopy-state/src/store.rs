//! StateStore — redb-backed persistence for Canopy rollouts.
//!
//! Provides typed operations over rollouts, rollout groups, group
//! membership, and the action ledger. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! redb serializes write transactions, so every read-check-write below is
//! atomic. Version checks on rollouts and groups catch writers that worked
//! from a stale read.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Persist a new rollout in CREATING with its groups (all SCHEDULED)
    /// and their membership, in one transaction.
    ///
    /// Group order is the order of `groups`; each group's parent is the
    /// group before it.
    pub fn insert_rollout(
        &self,
        draft: RolloutDraft,
        groups: Vec<GroupDraft>,
    ) -> StateResult<(Rollout, Vec<RolloutGroup>)> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;

        {
            let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let existing: Rollout = decode(value.value())?;
                if !existing.deleted && existing.name == draft.name {
                    return Err(StateError::Constraint(format!(
                        "rollout named '{}' already exists",
                        draft.name
                    )));
                }
            }
        }

        let base = allocate_ids(&txn, 1 + groups.len() as u64)?;
        let total_targets = groups.iter().map(|g| g.members.len() as u64).sum();

        let rollout = Rollout {
            id: base,
            name: draft.name,
            description: draft.description,
            bundle_id: draft.bundle_id,
            target_query: draft.target_query,
            status: RolloutStatus::Creating,
            conditions: draft.conditions,
            total_targets,
            start_at: draft.start_at,
            deleted: false,
            approval_decided_by: None,
            approval_remark: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let mut saved_groups = Vec::with_capacity(groups.len());
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut group_table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let mut members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;

            let value = encode(&rollout)?;
            rollouts
                .insert(rollout.id, value.as_slice())
                .map_err(map_err!(Write))?;

            let mut parent = None;
            let mut position = 0u64;
            for (ordinal, draft) in groups.into_iter().enumerate() {
                let group = RolloutGroup {
                    id: base + 1 + ordinal as u64,
                    rollout_id: rollout.id,
                    parent,
                    ordinal: ordinal as u32,
                    name: draft.name,
                    target_percentage: draft.target_percentage,
                    target_count: draft.members.len() as u64,
                    status: GroupStatus::Scheduled,
                    conditions: draft.conditions,
                    version: 1,
                    updated_at: now,
                };
                let value = encode(&group)?;
                group_table
                    .insert(group.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                for target in &draft.members {
                    let key = target_key(rollout.id, group.id, target);
                    members
                        .insert(key.as_str(), position)
                        .map_err(map_err!(Write))?;
                    position += 1;
                }
                parent = Some(group.id);
                saved_groups.push(group);
            }
        }

        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            rollout = rollout.id,
            groups = saved_groups.len(),
            targets = rollout.total_targets,
            "rollout stored"
        );
        Ok((rollout, saved_groups))
    }

    /// Get a rollout by ID.
    pub fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all rollouts, including soft-deleted ones.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List rollouts currently in `status`.
    pub fn list_rollouts_by_status(&self, status: RolloutStatus) -> StateResult<Vec<Rollout>> {
        Ok(self
            .list_rollouts()?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    /// Save a rollout read earlier. Fails with `Conflict` if it was
    /// modified in between. Returns the stored record (new version).
    pub fn save_rollout(&self, rollout: &Rollout) -> StateResult<Rollout> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let saved = {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let current: Rollout = match table.get(rollout.id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("rollout {}", rollout.id))),
            };
            check_version(&format!("rollout {}", rollout.id), rollout.version, current.version)?;

            let mut next = rollout.clone();
            next.version = current.version + 1;
            next.updated_at = epoch_secs();
            let value = encode(&next)?;
            table
                .insert(next.id, value.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout = saved.id, status = %saved.status, version = saved.version, "rollout saved");
        Ok(saved)
    }

    /// Remove a rollout with its groups, membership and actions.
    /// Returns true if the rollout existed.
    pub fn delete_rollout(&self, id: RolloutId) -> StateResult<bool> {
        let prefix = rollout_prefix(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            existed = rollouts.remove(id).map_err(map_err!(Write))?.is_some();

            let mut groups = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            for (key, _) in scan_bytes(&groups, &prefix)? {
                groups.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            for key in scan_keys(&members, &prefix)? {
                members.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            for (key, _) in scan_bytes(&actions, &prefix)? {
                actions.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout = id, existed, "rollout deleted");
        Ok(existed)
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// List a rollout's groups in execution order.
    pub fn list_groups(&self, rollout: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        scan_bytes(&table, &rollout_prefix(rollout))?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    /// Get one group of a rollout by its ID.
    pub fn get_group(&self, rollout: RolloutId, group: GroupId) -> StateResult<Option<RolloutGroup>> {
        Ok(self
            .list_groups(rollout)?
            .into_iter()
            .find(|g| g.id == group))
    }

    /// Save a group read earlier. Fails with `Conflict` on a stale version
    /// and with `InvalidTransition` if the status would move backwards.
    pub fn save_group(&self, group: &RolloutGroup) -> StateResult<RolloutGroup> {
        let key = group.table_key();
        let record = format!("group {}", group.id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let saved = {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let current: RolloutGroup = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(record)),
            };
            check_version(&record, group.version, current.version)?;
            if !current.status.can_transition_to(group.status) {
                return Err(StateError::InvalidTransition {
                    record,
                    from: current.status.to_string(),
                    to: group.status.to_string(),
                });
            }

            let mut next = group.clone();
            next.target_count = current.target_count;
            next.version = current.version + 1;
            next.updated_at = epoch_secs();
            let value = encode(&next)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            rollout = saved.rollout_id,
            group = saved.id,
            status = %saved.status,
            "group saved"
        );
        Ok(saved)
    }

    /// Targets assigned to a group.
    pub fn list_members(&self, rollout: RolloutId, group: GroupId) -> StateResult<Vec<TargetId>> {
        let prefix = group_prefix(rollout, group);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        Ok(scan_keys(&table, &prefix)?
            .into_iter()
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }

    /// Remove a target from a rollout (e.g. the device was deleted).
    ///
    /// Drops its membership and action record. The group's `target_count`
    /// is left unchanged. Returns true if the target was a member.
    pub fn remove_target(&self, rollout: RolloutId, group: GroupId, target: &str) -> StateResult<bool> {
        let key = target_key(rollout, group, target);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            existed = members.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            let mut actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            actions.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout, group, %target, existed, "target removed");
        Ok(existed)
    }

    // ── Action ledger ──────────────────────────────────────────────

    /// Create SCHEDULED actions for up to `limit` group members that do not
    /// have one yet. Returns the number created; 0 means the group is
    /// fully materialized.
    pub fn create_missing_actions(
        &self,
        rollout: &Rollout,
        group: &RolloutGroup,
        limit: usize,
    ) -> StateResult<u64> {
        let prefix = group_prefix(rollout.id, group.id);
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created = {
            let members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            let mut actions = txn.open_table(ACTIONS).map_err(map_err!(Table))?;

            let mut missing = Vec::new();
            for key in scan_keys(&members, &prefix)? {
                if actions.get(key.as_str()).map_err(map_err!(Read))?.is_none() {
                    missing.push(key);
                    if missing.len() >= limit {
                        break;
                    }
                }
            }
            if missing.is_empty() {
                0
            } else {
                let first_id = allocate_ids(&txn, missing.len() as u64)?;
                for (offset, key) in missing.iter().enumerate() {
                    let action = Action {
                        id: first_id + offset as u64,
                        rollout_id: rollout.id,
                        group_id: group.id,
                        target_id: key[prefix.len()..].to_string(),
                        bundle_id: rollout.bundle_id.clone(),
                        status: ActionStatus::Scheduled,
                        created_at: now,
                        updated_at: now,
                    };
                    let value = encode(&action)?;
                    actions
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
                missing.len() as u64
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if created > 0 {
            debug!(rollout = rollout.id, group = group.id, created, "scheduled actions created");
        }
        Ok(created)
    }

    /// List all actions of a group.
    pub fn list_actions(&self, rollout: RolloutId, group: GroupId) -> StateResult<Vec<Action>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        scan_bytes(&table, &group_prefix(rollout, group))?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    /// Count a group's actions, optionally only those in `status`.
    ///
    /// Runs in its own read transaction, so it observes every committed
    /// status write and nothing uncommitted.
    pub fn count_actions(
        &self,
        rollout: RolloutId,
        group: GroupId,
        status: Option<ActionStatus>,
    ) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
        let entries = scan_bytes(&table, &group_prefix(rollout, group))?;
        let Some(status) = status else {
            return Ok(entries.len() as u64);
        };
        let mut count = 0;
        for (_, value) in entries {
            let action: Action = decode(&value)?;
            if action.status == status {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Record a status reported for a target's action.
    ///
    /// Terminal statuses are write-once.
    pub fn update_action_status(
        &self,
        rollout: RolloutId,
        group: GroupId,
        target: &str,
        status: ActionStatus,
    ) -> StateResult<Action> {
        let key = target_key(rollout, group, target);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            let mut action: Action = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("action {key}"))),
            };
            if action.status.is_terminal() {
                return Err(StateError::TerminalAction {
                    key,
                    status: action.status.to_string(),
                    requested: status.to_string(),
                });
            }
            if !action.status.can_transition_to(status) {
                return Err(StateError::InvalidTransition {
                    record: format!("action {key}"),
                    from: action.status.to_string(),
                    to: status.to_string(),
                });
            }
            action.status = status;
            action.updated_at = epoch_secs();
            let value = encode(&action)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            action
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Move the SCHEDULED actions for `bundle` of the group whose parent is
    /// `parent` (the first group when `None`) to RUNNING, `batch` per
    /// transaction.
    ///
    /// Returns the number of actions started.
    pub fn start_scheduled_actions(
        &self,
        rollout: RolloutId,
        bundle: &str,
        parent: Option<GroupId>,
        batch: usize,
    ) -> StateResult<u64> {
        let groups = self.list_groups(rollout)?;
        let Some(child) = groups.iter().find(|g| g.parent == parent) else {
            return Ok(0);
        };
        let prefix = group_prefix(rollout, child.id);
        let batch = batch.max(1);
        let mut total = 0;

        loop {
            let now = epoch_secs();
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            let started = {
                let mut table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
                let mut pending = Vec::new();
                for (key, value) in scan_bytes(&table, &prefix)? {
                    let action: Action = decode(&value)?;
                    if action.status == ActionStatus::Scheduled && action.bundle_id == bundle {
                        pending.push((key, action));
                        if pending.len() >= batch {
                            break;
                        }
                    }
                }
                for (key, action) in &mut pending {
                    action.status = ActionStatus::Running;
                    action.updated_at = now;
                    let value = encode(&*action)?;
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
                pending.len()
            };
            txn.commit().map_err(map_err!(Transaction))?;
            total += started as u64;
            if started < batch {
                break;
            }
        }

        debug!(rollout, group = child.id, started = total, "scheduled actions started");
        Ok(total)
    }

    /// Remove every SCHEDULED action of a rollout. Returns the number removed.
    pub fn delete_scheduled_actions(&self, rollout: RolloutId) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(ACTIONS).map_err(map_err!(Table))?;
            let mut scheduled = Vec::new();
            for (key, value) in scan_bytes(&table, &rollout_prefix(rollout))? {
                let action: Action = decode(&value)?;
                if action.status == ActionStatus::Scheduled {
                    scheduled.push(key);
                }
            }
            for key in &scheduled {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            scheduled.len() as u64
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout, removed, "scheduled actions deleted");
        Ok(removed)
    }
}

/// Reserve `count` consecutive ids from the store-wide sequence.
fn allocate_ids(txn: &WriteTransaction, count: u64) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let next = meta
        .get(NEXT_ID)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(1);
    meta.insert(NEXT_ID, next + count).map_err(map_err!(Write))?;
    Ok(next)
}

fn check_version(record: &str, expected: u64, found: u64) -> StateResult<()> {
    if expected != found {
        return Err(StateError::Conflict {
            record: record.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Collect `(key, value)` pairs whose key starts with `prefix`.
fn scan_bytes<T>(table: &T, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push((key.value().to_string(), value.value().to_vec()));
    }
    Ok(results)
}

/// Collect the keys starting with `prefix` of a membership-style table.
fn scan_keys<T>(table: &T, prefix: &str) -> StateResult<Vec<String>>
where
    T: ReadableTable<&'static str, u64>,
{
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(key.value().to_string());
    }
    Ok(results)
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}
