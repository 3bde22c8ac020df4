//! Snapshot and restore support for memory storage.
//!
//! A snapshot is a deep copy of every record, log and edit chain. Creating one
//! takes the storage read lock; restoring takes the write lock, so both are
//! atomic with respect to concurrent mutations.

use std::collections::{BTreeMap, HashMap};

use courier_storage_traits::ConversationId;
use courier_storage_traits::messages::edit_chain::EditChain;
use courier_storage_traits::messages::types::{LogPosition, MessageKey, MessageRecord};

use crate::CourierMemoryStorageInner;

/// A snapshot of all in-memory state that can be restored later.
///
/// # Example
///
/// ```ignore
/// let storage = CourierMemoryStorage::default();
/// storage.append_message(record)?;
///
/// // Everything written so far survives the "crash"
/// let snapshot = storage.create_snapshot();
/// drop(storage);
///
/// let reopened = CourierMemoryStorage::from_snapshot(snapshot, ValidationLimits::default());
/// ```
#[derive(Clone)]
pub struct MemoryStorageSnapshot {
    pub(crate) next_record_id: u64,
    pub(crate) records: HashMap<MessageKey, MessageRecord>,
    pub(crate) logs: HashMap<ConversationId, BTreeMap<LogPosition, MessageKey>>,
    pub(crate) edit_chains: HashMap<MessageKey, EditChain>,
}

impl MemoryStorageSnapshot {
    pub(crate) fn capture(inner: &CourierMemoryStorageInner) -> Self {
        let inner = inner.clone();
        Self {
            next_record_id: inner.next_record_id,
            records: inner.records,
            logs: inner.logs,
            edit_chains: inner.edit_chains,
        }
    }

    pub(crate) fn into_inner(self) -> CourierMemoryStorageInner {
        CourierMemoryStorageInner {
            next_record_id: self.next_record_id,
            records: self.records,
            logs: self.logs,
            edit_chains: self.edit_chains,
        }
    }

    /// Number of records captured, tombstones included
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}
