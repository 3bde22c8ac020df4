//! Shared helpers for pipeline integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Once};

use courier_core::clock::ManualClock;
use courier_core::notify::{Change, ChangeKind, ChangeSubscriber};
use courier_core::prelude::*;
use courier_memory_storage::CourierMemoryStorage;
use courier_storage_traits::Backend;
use courier_storage_traits::messages::edit_chain::{EditChain, EditEntry};
use courier_storage_traits::messages::error::MessageError;
use courier_storage_traits::messages::types::{
    AppendResult, DeleteResult, NewMessageRecord, RevisionResult,
};
use courier_storage_traits::test_utils::{author, conversation};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Local time every test clock starts at
pub const NOW: u64 = 1_700_000_000_000;

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Clock fixed at [`NOW`]
pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(NOW))
}

/// Default configuration accepting any past source timestamp, so tests can use
/// small literal timestamps
pub fn config() -> CourierConfig {
    CourierConfig {
        max_envelope_age_ms: u64::MAX,
        ..Default::default()
    }
}

/// Pipeline over `storage` with a fixed clock
pub fn pipeline<S>(storage: S) -> IngestionPipeline<S>
where
    S: MessageStorage,
{
    init_tracing();
    IngestionPipeline::builder(storage)
        .with_config(config())
        .with_clock(clock())
        .build()
        .expect("Failed to build pipeline")
}

/// Pipeline over fresh memory storage with a fixed clock
pub fn memory_pipeline() -> IngestionPipeline<CourierMemoryStorage> {
    pipeline(CourierMemoryStorage::default())
}

/// New text message in conversation `conv` from `from`
pub fn new_text(conv: &str, from: &str, ts: u64, text: &str) -> Envelope {
    Envelope::new_message(conversation(conv), author(from), ts, Body::text(text))
}

/// Text edit
pub fn edit_text(conv: &str, from: &str, ts: u64, revision: u32, text: &str) -> Envelope {
    Envelope::edit(conversation(conv), author(from), ts, revision, Body::text(text))
}

/// Delete
pub fn delete(conv: &str, from: &str, ts: u64) -> Envelope {
    Envelope::delete(conversation(conv), author(from), ts)
}

/// Subscriber recording every change it sees
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    changes: Mutex<Vec<Change>>,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> Vec<Change> {
        self.changes.lock().clone()
    }

    pub fn kinds(&self) -> Vec<ChangeKind> {
        self.changes.lock().iter().map(|c| c.kind).collect()
    }
}

impl ChangeSubscriber for RecordingSubscriber {
    fn on_change(&self, change: &Change) {
        self.changes.lock().push(change.clone());
    }
}

/// Memory storage with failure injection and a gate that parks appends for one
/// key until released
pub struct HookedStorage {
    inner: CourierMemoryStorage,
    fail_writes: AtomicBool,
    fail_revisions: AtomicBool,
    gated_key: Option<MessageKey>,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl HookedStorage {
    pub fn new() -> Self {
        Self {
            inner: CourierMemoryStorage::default(),
            fail_writes: AtomicBool::new(false),
            fail_revisions: AtomicBool::new(false),
            gated_key: None,
            gate: Mutex::new(None),
        }
    }

    /// Appends for `key` signal on `entered`, then wait for `release` before
    /// touching storage
    pub fn gated(key: MessageKey, entered: Sender<()>, release: Receiver<()>) -> Self {
        Self {
            gated_key: Some(key),
            gate: Mutex::new(Some((entered, release))),
            ..Self::new()
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only edit writes, appends and deletes still succeed
    pub fn fail_revisions(&self, fail: bool) {
        self.fail_revisions.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &CourierMemoryStorage {
        &self.inner
    }

    fn check_writes(&self) -> Result<(), MessageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MessageError::DatabaseError("disk I/O error".to_string()));
        }
        Ok(())
    }
}

impl MessageStorage for HookedStorage {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    fn append_message(&self, record: NewMessageRecord) -> Result<AppendResult, MessageError> {
        self.check_writes()?;
        if self.gated_key.as_ref() == Some(&record.key) {
            let gate = self.gate.lock();
            if let Some((entered, release)) = gate.as_ref() {
                let _ = entered.send(());
                let _ = release.recv();
            }
        }
        self.inner.append_message(record)
    }

    fn find_message(&self, key: &MessageKey) -> Result<Option<MessageRecord>, MessageError> {
        self.inner.find_message(key)
    }

    fn apply_revision(
        &self,
        key: &MessageKey,
        entry: EditEntry,
    ) -> Result<RevisionResult, MessageError> {
        self.check_writes()?;
        if self.fail_revisions.load(Ordering::SeqCst) {
            return Err(MessageError::DatabaseError("disk I/O error".to_string()));
        }
        self.inner.apply_revision(key, entry)
    }

    fn mark_deleted(&self, key: &MessageKey) -> Result<DeleteResult, MessageError> {
        self.check_writes()?;
        self.inner.mark_deleted(key)
    }

    fn find_edit_chain(&self, key: &MessageKey) -> Result<Option<EditChain>, MessageError> {
        self.inner.find_edit_chain(key)
    }

    fn messages_after(
        &self,
        conversation_id: &ConversationId,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MessageError> {
        self.inner.messages_after(conversation_id, cursor, limit)
    }

    fn conversations(&self) -> Result<Vec<ConversationId>, MessageError> {
        self.inner.conversations()
    }

    fn latest_received_at(&self) -> Result<Option<u64>, MessageError> {
        self.inner.latest_received_at()
    }
}
