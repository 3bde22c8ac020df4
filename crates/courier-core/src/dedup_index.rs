//! In-memory deduplication index
//!
//! Maps every known [`MessageKey`] to a small [`Handle`] describing the stored
//! record. The index is a derived cache: storage stays authoritative and the
//! index is rebuilt from it on every start.

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, RandomState};

use courier_storage_traits::messages::MessageStorage;
use courier_storage_traits::messages::types::{Cursor, MessageKey, MessageRecord, RecordId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::store::ConversationStore;

/// Cached state of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    /// Storage record id
    pub record_id: RecordId,
    /// Current revision
    pub revision: u32,
    /// Tombstone marker
    pub is_deleted: bool,
}

impl Handle {
    /// Handle describing `record`
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            record_id: record.record_id,
            revision: record.revision,
            is_deleted: record.is_deleted,
        }
    }

    /// Combine two views of the same record, keeping the most advanced state
    fn merge(self, other: Self) -> Self {
        Self {
            record_id: self.record_id,
            revision: self.revision.max(other.revision),
            is_deleted: self.is_deleted || other.is_deleted,
        }
    }
}

impl From<&MessageRecord> for Handle {
    fn from(record: &MessageRecord) -> Self {
        Self::from_record(record)
    }
}

/// Result of [`DedupIndex::insert_if_absent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was new
    Inserted,
    /// The key was already indexed; nothing changed
    AlreadyPresent(Handle),
}

/// Counters reported by [`DedupIndex::rebuild_from`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Conversations scanned
    pub conversations: usize,
    /// Records indexed, tombstones included
    pub records: usize,
    /// Tombstones indexed
    pub tombstones: usize,
}

type Shard = RwLock<HashMap<MessageKey, Handle>>;

/// Sharded concurrent map from [`MessageKey`] to [`Handle`].
///
/// Keys of one conversation land in the same shard, so a busy conversation
/// never contends with the rest. Every operation touches exactly one shard
/// lock, which makes per-key operations linearizable.
#[derive(Debug)]
pub struct DedupIndex {
    shards: Box<[Shard]>,
    hasher: RandomState,
}

impl Default for DedupIndex {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SHARDS)
    }
}

impl DedupIndex {
    /// Shard count used by [`DedupIndex::default`]
    pub const DEFAULT_SHARDS: usize = 16;

    /// Empty index with `shard_count` shards (at least one)
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &MessageKey) -> &Shard {
        let hash = self.hasher.hash_one(&key.conversation_id);
        // Modulo keeps the index inside the shard count
        let index = (hash % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Cached handle for `key`
    pub fn lookup(&self, key: &MessageKey) -> Option<Handle> {
        self.shard(key).read().get(key).copied()
    }

    /// Whether `key` has been seen
    pub fn contains(&self, key: &MessageKey) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Atomically insert `handle` unless `key` is already indexed
    pub fn insert_if_absent(&self, key: MessageKey, handle: Handle) -> InsertOutcome {
        let mut shard = self.shard(&key).write();
        match shard.get(&key) {
            Some(existing) => InsertOutcome::AlreadyPresent(*existing),
            None => {
                shard.insert(key, handle);
                InsertOutcome::Inserted
            }
        }
    }

    /// Refresh the cached state of `key`.
    ///
    /// Revision and tombstone state only ever move forward: a late refresh
    /// carrying an older view cannot roll the entry back.
    pub fn update(&self, key: MessageKey, handle: Handle) {
        let mut shard = self.shard(&key).write();
        shard
            .entry(key)
            .and_modify(|existing| *existing = existing.merge(handle))
            .or_insert(handle);
    }

    /// Number of indexed keys
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Whether no key is indexed
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Ordered copy of the whole index
    pub fn snapshot(&self) -> BTreeMap<MessageKey, Handle> {
        let mut snapshot = BTreeMap::new();
        for shard in self.shards.iter() {
            for (key, handle) in shard.read().iter() {
                snapshot.insert(key.clone(), *handle);
            }
        }
        snapshot
    }

    /// Build a fresh index by streaming every conversation from the beginning.
    ///
    /// No persisted index state is read; the result only depends on what the
    /// storage backend holds.
    pub fn rebuild_from<S>(
        store: &ConversationStore<S>,
        shard_count: usize,
    ) -> Result<(Self, RebuildStats), Error>
    where
        S: MessageStorage,
    {
        let index = Self::new(shard_count);
        let mut stats = RebuildStats::default();

        for conversation_id in store.conversations()? {
            stats.conversations += 1;
            for record in store.stream_since(&conversation_id, Cursor::start()) {
                let record = record?;
                if record.is_deleted {
                    stats.tombstones += 1;
                }
                stats.records += 1;
                index.update(record.key.clone(), Handle::from_record(&record));
            }
        }

        tracing::info!(
            target: "courier_core::dedup_index::rebuild_from",
            "Rebuilt dedup index: {} conversations, {} records, {} tombstones",
            stats.conversations,
            stats.records,
            stats.tombstones
        );

        Ok((index, stats))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use courier_storage_traits::test_utils::key;

    use super::*;

    fn handle(id: u64, revision: u32, is_deleted: bool) -> Handle {
        Handle {
            record_id: RecordId::new(id),
            revision,
            is_deleted,
        }
    }

    #[test]
    fn test_insert_if_absent() {
        let index = DedupIndex::default();
        let k = key("c", "a", 1);

        assert_eq!(index.lookup(&k), None);
        assert_eq!(
            index.insert_if_absent(k.clone(), handle(1, 0, false)),
            InsertOutcome::Inserted
        );
        assert_eq!(
            index.insert_if_absent(k.clone(), handle(2, 0, false)),
            InsertOutcome::AlreadyPresent(handle(1, 0, false))
        );
        assert_eq!(index.lookup(&k), Some(handle(1, 0, false)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_update_never_rolls_back() {
        let index = DedupIndex::default();
        let k = key("c", "a", 1);
        index.update(k.clone(), handle(1, 3, false));
        index.update(k.clone(), handle(1, 2, false));
        assert_eq!(index.lookup(&k), Some(handle(1, 3, false)));

        index.update(k.clone(), handle(1, 3, true));
        index.update(k.clone(), handle(1, 3, false));
        assert_eq!(index.lookup(&k), Some(handle(1, 3, true)));
    }

    #[test]
    fn test_single_shard() {
        let index = DedupIndex::new(0);
        index.update(key("c", "a", 1), handle(1, 0, false));
        index.update(key("d", "a", 1), handle(2, 0, false));
        assert_eq!(index.len(), 2);
        assert!(!index.is_empty());
        assert_eq!(index.snapshot().len(), 2);
    }

    #[test]
    fn test_concurrent_insert_has_one_winner() {
        let index = Arc::new(DedupIndex::default());
        let k = key("c", "a", 1);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = Arc::clone(&index);
                let k = k.clone();
                thread::spawn(move || index.insert_if_absent(k, handle(i, 0, false)))
            })
            .collect();

        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == InsertOutcome::Inserted)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(index.len(), 1);
    }
}
