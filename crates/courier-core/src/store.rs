//! Conversation store
//!
//! [`ConversationStore`] wraps a [`MessageStorage`] backend with the per-key
//! locking that serializes every mutation of one [`MessageKey`]. Distinct keys
//! never share a lock, so a slow write for one message does not hold up any
//! other message.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use courier_storage_traits::messages::MessageStorage;
use courier_storage_traits::messages::edit_chain::{EditChain, EditEntry};
use courier_storage_traits::messages::types::{
    AppendResult, Body, Cursor, DeleteResult, MessageKey, MessageRecord, NewMessageRecord,
    RevisionResult,
};
use courier_storage_traits::{Backend, ConversationId};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::Error;

/// Why an edit was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditRejection {
    /// Revision is not newer than the stored one
    Stale {
        /// Stored revision
        current: u32,
    },
    /// No record for the key
    NotFound,
    /// Record is deleted
    Tombstoned,
}

/// Result of [`KeyGuard::apply_edit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// Edit applied; the updated record
    Applied(MessageRecord),
    /// Edit not applied
    Rejected(EditRejection),
}

/// Why a delete was not applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteRejection {
    /// No record for the key
    NotFound,
    /// Record already deleted; the tombstone
    AlreadyDeleted(MessageRecord),
}

/// Result of [`KeyGuard::apply_delete`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Delete applied; the tombstone
    Applied(MessageRecord),
    /// Delete not applied
    Rejected(DeleteRejection),
}

/// Per-key lock table.
///
/// An entry lives only while some guard holds or waits for it.
#[derive(Default)]
struct KeyLocks {
    table: Mutex<HashMap<MessageKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn lock(&self, key: &MessageKey) -> ArcMutexGuard<RawMutex, ()> {
        let slot = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(key.clone()).or_default())
        };
        slot.lock_arc()
    }

    fn release(&self, key: &MessageKey, guard: ArcMutexGuard<RawMutex, ()>) {
        drop(guard);
        let mut table = self.table.lock();
        // Only the table itself still references the slot: nobody holds or
        // waits for this key, and new waiters must go through the table lock.
        if table
            .get(key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            table.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.table.lock().len()
    }
}

/// Exclusive access to one [`MessageKey`].
///
/// Every mutation goes through a guard; the lock is released on drop.
pub struct KeyGuard<'a, S>
where
    S: MessageStorage,
{
    store: &'a ConversationStore<S>,
    key: MessageKey,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl<S> fmt::Debug for KeyGuard<'_, S>
where
    S: MessageStorage,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

impl<S> Drop for KeyGuard<'_, S>
where
    S: MessageStorage,
{
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.store.locks.release(&self.key, guard);
        }
    }
}

impl<S> KeyGuard<'_, S>
where
    S: MessageStorage,
{
    /// The locked key
    pub fn key(&self) -> &MessageKey {
        &self.key
    }

    /// Append `record`, which must carry the locked key.
    pub fn append(&self, record: NewMessageRecord) -> Result<AppendResult, Error> {
        debug_assert_eq!(record.key, self.key, "record key differs from locked key");
        Ok(self.store.storage.append_message(record)?)
    }

    /// Apply `body` as `revision`, stamped with the store clock.
    pub fn apply_edit(&self, revision: u32, body: Body) -> Result<EditOutcome, Error> {
        let entry = EditEntry {
            revision,
            body,
            applied_at: self.store.clock.now_millis(),
        };

        let outcome = match self.store.storage.apply_revision(&self.key, entry)? {
            RevisionResult::Applied(record) => EditOutcome::Applied(record),
            RevisionResult::Stale { current } => {
                EditOutcome::Rejected(EditRejection::Stale { current })
            }
            RevisionResult::Tombstoned => EditOutcome::Rejected(EditRejection::Tombstoned),
            RevisionResult::NotFound => EditOutcome::Rejected(EditRejection::NotFound),
        };
        Ok(outcome)
    }

    /// Tombstone the record
    pub fn apply_delete(&self) -> Result<DeleteOutcome, Error> {
        let outcome = match self.store.storage.mark_deleted(&self.key)? {
            DeleteResult::Applied(record) => DeleteOutcome::Applied(record),
            DeleteResult::AlreadyDeleted(record) => {
                DeleteOutcome::Rejected(DeleteRejection::AlreadyDeleted(record))
            }
            DeleteResult::NotFound => DeleteOutcome::Rejected(DeleteRejection::NotFound),
        };
        Ok(outcome)
    }
}

/// Durable, ordered per-conversation message log.
pub struct ConversationStore<S>
where
    S: MessageStorage,
{
    storage: S,
    locks: KeyLocks,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl<S> fmt::Debug for ConversationStore<S>
where
    S: MessageStorage,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationStore")
            .field("backend", &self.storage.backend())
            .field("locked_keys", &self.locks.len())
            .field("clock", &self.clock)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl<S> ConversationStore<S>
where
    S: MessageStorage,
{
    /// Wrap `storage`. `page_size` is the number of records fetched per storage
    /// round trip when streaming (at least one).
    pub fn new(storage: S, clock: Arc<dyn Clock>, page_size: usize) -> Self {
        Self {
            storage,
            locks: KeyLocks::default(),
            clock,
            page_size: page_size.max(1),
        }
    }

    /// The storage backend
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Backend type
    pub fn backend(&self) -> Backend {
        self.storage.backend()
    }

    /// The receive clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current receive time
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Take the lock for `key`, blocking while another writer holds it
    pub fn lock(&self, key: &MessageKey) -> KeyGuard<'_, S> {
        let guard = self.locks.lock(key);
        KeyGuard {
            store: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on
    pub fn locked_keys(&self) -> usize {
        self.locks.len()
    }

    /// Lock the record's key and append it
    pub fn append(&self, record: NewMessageRecord) -> Result<AppendResult, Error> {
        let key = record.key.clone();
        self.lock(&key).append(record)
    }

    /// Lock `key` and apply an edit
    pub fn apply_edit(
        &self,
        key: &MessageKey,
        revision: u32,
        body: Body,
    ) -> Result<EditOutcome, Error> {
        self.lock(key).apply_edit(revision, body)
    }

    /// Lock `key` and tombstone its record
    pub fn apply_delete(&self, key: &MessageKey) -> Result<DeleteOutcome, Error> {
        self.lock(key).apply_delete()
    }

    /// Current record for `key`, tombstones included
    pub fn get(&self, key: &MessageKey) -> Result<Option<MessageRecord>, Error> {
        Ok(self.storage.find_message(key)?)
    }

    /// Edit history for `key`
    pub fn edit_chain(&self, key: &MessageKey) -> Result<Option<EditChain>, Error> {
        Ok(self.storage.find_edit_chain(key)?)
    }

    /// Every conversation with at least one record
    pub fn conversations(&self) -> Result<Vec<ConversationId>, Error> {
        Ok(self.storage.conversations()?)
    }

    /// Newest `received_at` in storage
    pub fn latest_received_at(&self) -> Result<Option<u64>, Error> {
        Ok(self.storage.latest_received_at()?)
    }

    /// Lazily stream a conversation log starting after `cursor`.
    ///
    /// Records are fetched one page at a time. The stream can be dropped at any
    /// point and resumed later from [`RecordStream::cursor`].
    pub fn stream_since(&self, conversation_id: &ConversationId, cursor: Cursor) -> RecordStream<'_, S> {
        RecordStream {
            store: self,
            conversation_id: conversation_id.clone(),
            cursor,
            page: VecDeque::new(),
            finished: false,
        }
    }
}

/// Page-by-page iterator over one conversation log.
///
/// Yields records in log order. A storage failure is yielded once and ends the
/// stream; the cursor still points after the last good record.
pub struct RecordStream<'a, S>
where
    S: MessageStorage,
{
    store: &'a ConversationStore<S>,
    conversation_id: ConversationId,
    cursor: Cursor,
    page: VecDeque<MessageRecord>,
    finished: bool,
}

impl<S> fmt::Debug for RecordStream<'_, S>
where
    S: MessageStorage,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStream")
            .field("conversation_id", &self.conversation_id)
            .field("cursor", &self.cursor)
            .field("buffered", &self.page.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<S> RecordStream<'_, S>
where
    S: MessageStorage,
{
    /// Position right after the last record yielded
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    fn fetch_page(&mut self) -> Result<(), Error> {
        let page = self.store.storage.messages_after(
            &self.conversation_id,
            &self.cursor,
            self.store.page_size,
        )?;
        if page.len() < self.store.page_size {
            self.finished = true;
        }
        self.page.extend(page);
        Ok(())
    }
}

impl<S> Iterator for RecordStream<'_, S>
where
    S: MessageStorage,
{
    type Item = Result<MessageRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.finished {
            if let Err(e) = self.fetch_page() {
                self.finished = true;
                return Some(Err(e));
            }
        }

        let record = self.page.pop_front()?;
        self.cursor = Cursor::after(&record);
        Some(Ok(record))
    }
}
