//! Replicated state owned by the apply loop.
//!
//! This module holds the data that the shard controller replicates: the
//! history of shard configurations and the per-client deduplication table.
//! Both are only written by the apply loop, one committed command at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command::{ClientId, GroupId, ShardId, UNASSIGNED};
use crate::error::ControllerError;

/// An assignment of shards to replica groups.
///
/// `shards[i]` is the group owning shard `i` ([`UNASSIGNED`] if none), and
/// `groups` maps each joined group to its server addresses.
/// Iterating `groups` yields ascending ids, the order the rebalancer relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub version: u64,
    pub shards: Vec<GroupId>,
    pub groups: BTreeMap<GroupId, Vec<String>>,
}

impl ShardConfig {
    /// The configuration every history starts with: no groups, nothing assigned.
    pub fn initial(num_shards: usize) -> Self {
        Self {
            version: 0,
            shards: vec![UNASSIGNED; num_shards],
            groups: BTreeMap::new(),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn owner(&self, shard: ShardId) -> Option<GroupId> {
        self.shards.get(shard).copied()
    }

    /// Shards owned by `group`, in ascending order.
    pub fn shards_of(&self, group: GroupId) -> Vec<ShardId> {
        self.shards
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == group)
            .map(|(shard, _)| shard)
            .collect()
    }

    /// Number of shards owned by each joined group (zero included).
    pub fn load(&self) -> BTreeMap<GroupId, usize> {
        let mut load: BTreeMap<GroupId, usize> =
            self.groups.keys().map(|gid| (*gid, 0)).collect();
        for owner in &self.shards {
            if let Some(count) = load.get_mut(owner) {
                *count += 1;
            }
        }
        load
    }

    /// A copy of this configuration with the next version number.
    pub fn successor(&self) -> Self {
        Self {
            version: self.version + 1,
            shards: self.shards.clone(),
            groups: self.groups.clone(),
        }
    }
}

/// Append-only history of configurations.
///
/// Entries are wrapped in `Arc` so readers can hold on to a snapshot after the
/// lock protecting the store is released. Nothing is ever removed: a query may
/// ask for any past version.
#[derive(Debug)]
pub struct ConfigStore {
    configs: Vec<Arc<ShardConfig>>,
}

impl ConfigStore {
    pub fn new(num_shards: usize) -> Self {
        Self {
            configs: vec![Arc::new(ShardConfig::initial(num_shards))],
        }
    }

    /// Appends the next configuration. Its version must equal the current length.
    pub fn append(&mut self, config: ShardConfig) -> Result<Arc<ShardConfig>, ControllerError> {
        let expected = self.configs.len() as u64;
        if config.version != expected {
            return Err(ControllerError::VersionOutOfOrder {
                expected,
                actual: config.version,
            });
        }
        let config = Arc::new(config);
        self.configs.push(Arc::clone(&config));
        Ok(config)
    }

    pub fn latest(&self) -> &Arc<ShardConfig> {
        // The history is created with version 0 and never shrinks.
        &self.configs[self.configs.len() - 1]
    }

    /// The configuration at `version`, or the latest one when `version` is
    /// negative or beyond the known history.
    pub fn at(&self, version: i64) -> &Arc<ShardConfig> {
        usize::try_from(version)
            .ok()
            .and_then(|version| self.configs.get(version))
            .unwrap_or_else(|| self.latest())
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ShardConfig>> {
        self.configs.iter()
    }
}

/// Last applied sequence number per client.
///
/// Updated for every committed command, duplicates included, so the table
/// reflects the full committed history on every replica.
#[derive(Debug, Default)]
pub struct DedupTable {
    last_applied: HashMap<ClientId, u64>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client we have never heard from has no duplicates.
    pub fn is_duplicate(&self, client_id: ClientId, sequence: u64) -> bool {
        self.last_applied
            .get(&client_id)
            .is_some_and(|last| sequence <= *last)
    }

    /// Records `sequence` for `client_id`. Never moves backwards.
    pub fn record(&mut self, client_id: ClientId, sequence: u64) {
        let last = self.last_applied.entry(client_id).or_insert(sequence);
        *last = (*last).max(sequence);
    }

    pub fn last_applied(&self, client_id: ClientId) -> Option<u64> {
        self.last_applied.get(&client_id).copied()
    }

    pub fn len(&self) -> usize {
        self.last_applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_starts_with_empty_configuration() {
        let store = ConfigStore::new(10);
        assert_eq!(store.len(), 1);
        let first = store.latest();
        assert_eq!(first.version, 0);
        assert!(first.groups.is_empty());
        assert!(first.shards.iter().all(|gid| *gid == UNASSIGNED));
        assert_eq!(first.num_shards(), 10);
    }

    #[test]
    fn append_requires_next_version() {
        let mut store = ConfigStore::new(4);
        let next = store.latest().successor();
        assert!(store.append(next.clone()).is_ok());

        // Same version again is a gap in the other direction.
        assert_eq!(
            store.append(next),
            Err(ControllerError::VersionOutOfOrder {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn at_falls_back_to_latest() {
        let mut store = ConfigStore::new(4);
        let mut next = store.latest().successor();
        next.shards[0] = 9;
        store.append(next).unwrap();

        assert_eq!(store.at(0).version, 0);
        assert_eq!(store.at(1).version, 1);
        assert_eq!(store.at(-1).version, 1);
        assert_eq!(store.at(57).version, 1);
        for (i, config) in store.iter().enumerate() {
            assert_eq!(config.version, i as u64);
        }
    }

    #[test]
    fn load_counts_only_joined_groups() {
        let mut config = ShardConfig::initial(5);
        config.groups.insert(1, vec!["a".into()]);
        config.groups.insert(2, vec!["b".into()]);
        config.shards = vec![1, 1, 3, 0, 1];

        let load = config.load();
        assert_eq!(load.get(&1), Some(&3));
        assert_eq!(load.get(&2), Some(&0));
        assert_eq!(load.get(&3), None);
        assert_eq!(config.shards_of(1), vec![0, 1, 4]);
    }

    #[test]
    fn dedup_table_is_monotonic() {
        let mut table = DedupTable::new();
        assert!(!table.is_duplicate(7, 0));

        table.record(7, 5);
        assert!(table.is_duplicate(7, 5));
        assert!(table.is_duplicate(7, 4));
        assert!(!table.is_duplicate(7, 6));

        table.record(7, 3);
        assert_eq!(table.last_applied(7), Some(5));
        assert!(!table.is_duplicate(8, 1));
    }
}
