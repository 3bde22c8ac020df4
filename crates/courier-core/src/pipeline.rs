//! Ingestion pipeline
//!
//! Every envelope goes through the same steps:
//!
//! 1. validate (pure, no storage access)
//! 2. take the per-key lock and consult the [`DedupIndex`]
//! 3. classify as new, edit, delete or duplicate and apply it to the
//!    [`ConversationStore`]
//! 4. refresh the index and notify subscribers, still under the key lock
//!
//! Outcomes that are not failures (duplicates, rejections, deferrals) are
//! returned as [`IngestOutcome`] values. Only storage failures surface as
//! errors, and only for the envelope that hit them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use courier_storage_traits::messages::MessageStorage;
use courier_storage_traits::messages::types::{AppendResult, Body, MessageKey, MessageRecord};
use parking_lot::Mutex;
use serde::Serialize;

use crate::CourierConfig;
use crate::clock::{Clock, SystemClock};
use crate::dedup_index::{DedupIndex, Handle, InsertOutcome, RebuildStats};
use crate::deferred::DeferredBuffer;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::notify::{Change, ChangeKind, ChangeSubscriber, Notifier, Subscription};
use crate::store::{
    ConversationStore, DeleteOutcome, DeleteRejection, EditOutcome, EditRejection, KeyGuard,
};
use crate::validation::{AllowAll, Authorizer, Mutation, ValidationError, validate_envelope};

/// Why an envelope was ignored as a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DuplicateReason {
    /// A record already exists for the key (first writer wins)
    AlreadyPresent,
    /// Edit revision is not newer than the stored one
    StaleRevision {
        /// Stored revision
        current: u32,
    },
    /// Delete of an already deleted record
    AlreadyDeleted,
}

/// Why an envelope was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Envelope failed validation
    Invalid {
        /// Validation failure
        error: ValidationError,
    },
    /// Edit of a deleted record; deletes are final
    EditAfterDelete,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { error } => write!(f, "invalid envelope: {}", error),
            Self::EditAfterDelete => write!(f, "edit of a deleted message"),
        }
    }
}

/// Result of ingesting one envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// New record appended
    Inserted {
        /// The stored record
        record: MessageRecord,
    },
    /// Edit applied
    Edited {
        /// The updated record
        record: MessageRecord,
    },
    /// Record tombstoned
    Deleted {
        /// The tombstone
        record: MessageRecord,
    },
    /// Nothing to do
    Duplicate {
        /// Targeted key
        key: MessageKey,
        /// Why
        #[serde(flatten)]
        reason: DuplicateReason,
    },
    /// Dropped, not retried
    Rejected {
        /// Targeted key
        key: MessageKey,
        /// Why
        #[serde(flatten)]
        reason: RejectReason,
    },
    /// Target not found yet; parked until its message arrives
    Deferred {
        /// Targeted key
        key: MessageKey,
    },
    /// Cancelled before the key was consulted
    Cancelled {
        /// Targeted key
        key: MessageKey,
    },
}

impl IngestOutcome {
    /// Key the envelope targeted
    pub fn key(&self) -> &MessageKey {
        match self {
            Self::Inserted { record } | Self::Edited { record } | Self::Deleted { record } => {
                &record.key
            }
            Self::Duplicate { key, .. }
            | Self::Rejected { key, .. }
            | Self::Deferred { key }
            | Self::Cancelled { key } => key,
        }
    }

    /// Whether storage was mutated
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            Self::Inserted { .. } | Self::Edited { .. } | Self::Deleted { .. }
        )
    }

    /// Short name, for logs
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::Edited { .. } => "edited",
            Self::Deleted { .. } => "deleted",
            Self::Duplicate { .. } => "duplicate",
            Self::Rejected { .. } => "rejected",
            Self::Deferred { .. } => "deferred",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Cooperative cancellation flag shared between a caller and the pipeline.
///
/// Cancellation is honoured up to the dedup consult; a mutation that already
/// started runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Fresh, not cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Builder for [`IngestionPipeline`]
///
/// # Examples
///
/// ```no_run
/// use courier_core::{CourierConfig, IngestionPipeline};
/// use courier_memory_storage::CourierMemoryStorage;
///
/// let pipeline = IngestionPipeline::builder(CourierMemoryStorage::default())
///     .with_config(CourierConfig::default())
///     .build()?;
/// # Ok::<(), courier_core::Error>(())
/// ```
#[derive(Debug)]
pub struct IngestionPipelineBuilder<S> {
    storage: S,
    config: CourierConfig,
    clock: Option<Arc<dyn Clock>>,
    authorizer: Arc<dyn Authorizer>,
}

impl<S> IngestionPipelineBuilder<S>
where
    S: MessageStorage,
{
    /// New builder over `storage` with default settings
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            config: CourierConfig::default(),
            clock: None,
            authorizer: Arc::new(AllowAll),
        }
    }

    /// Set a custom configuration
    pub fn with_config(mut self, config: CourierConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `clock` for receive stamps and timestamp checks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `authorizer` to check authors
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Open the pipeline: rebuild the dedup index from storage and seed the
    /// clock with the newest stored receive time.
    pub fn build(self) -> Result<IngestionPipeline<S>, Error> {
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let store = ConversationStore::new(self.storage, clock, self.config.stream_page_size);

        if let Some(latest) = store.latest_received_at()? {
            store.clock().observe(latest);
        }

        let (index, stats) = DedupIndex::rebuild_from(&store, self.config.dedup_shards)?;
        let deferred = DeferredBuffer::new(
            self.config.max_deferred_keys,
            self.config.max_deferred_per_key,
            self.config.deferred_ttl_ms,
        );

        Ok(IngestionPipeline {
            config: self.config,
            store,
            index,
            rebuild_stats: stats,
            notifier: Notifier::new(),
            deferred,
            authorizer: self.authorizer,
        })
    }
}

/// Incoming-message ingestion pipeline.
///
/// Safe to share between threads: `ingest` may be called concurrently, and
/// envelopes for distinct keys never wait on each other.
pub struct IngestionPipeline<S>
where
    S: MessageStorage,
{
    config: CourierConfig,
    store: ConversationStore<S>,
    index: DedupIndex,
    rebuild_stats: RebuildStats,
    notifier: Notifier,
    deferred: DeferredBuffer,
    authorizer: Arc<dyn Authorizer>,
}

impl<S> fmt::Debug for IngestionPipeline<S>
where
    S: MessageStorage,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("indexed_keys", &self.index.len())
            .field("notifier", &self.notifier)
            .field("deferred_keys", &self.deferred.len())
            .finish()
    }
}

impl<S> IngestionPipeline<S>
where
    S: MessageStorage,
{
    /// Create a builder
    pub fn builder(storage: S) -> IngestionPipelineBuilder<S> {
        IngestionPipelineBuilder::new(storage)
    }

    /// Open a pipeline with default configuration
    pub fn new(storage: S) -> Result<Self, Error> {
        Self::builder(storage).build()
    }

    /// Configuration in use
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// The conversation store
    pub fn store(&self) -> &ConversationStore<S> {
        &self.store
    }

    /// The dedup index
    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    /// What the start-up index rebuild found
    pub fn rebuild_stats(&self) -> RebuildStats {
        self.rebuild_stats
    }

    /// Register a change subscriber
    pub fn subscribe(&self, subscriber: Arc<dyn ChangeSubscriber>) -> Subscription {
        self.notifier.subscribe(subscriber)
    }

    /// Register a change channel
    pub fn subscribe_channel(
        &self,
    ) -> (Subscription, tokio::sync::mpsc::UnboundedReceiver<Change>) {
        self.notifier.subscribe_channel()
    }

    /// Number of keys with deferred envelopes
    pub fn deferred_keys(&self) -> usize {
        self.deferred.len()
    }

    /// Total deferred envelopes
    pub fn deferred_envelopes(&self) -> usize {
        self.deferred.pending()
    }

    /// Drop deferred envelopes older than the configured TTL
    pub fn expire_deferred(&self) -> usize {
        self.deferred.expire(self.store.now_millis())
    }

    /// Replay deferred envelopes whose message is already stored.
    ///
    /// Envelopes only stay parked for a stored message when an earlier replay
    /// hit a storage failure. Returns how many envelopes were replayed.
    pub fn retry_deferred(&self) -> usize {
        let mut replayed = 0;
        for key in self.deferred.keys() {
            if !self.index.contains(&key) {
                continue;
            }
            let guard = self.store.lock(&key);
            replayed += self.replay_deferred(&guard);
        }
        replayed
    }

    /// Ingest one envelope
    pub fn ingest(&self, envelope: Envelope) -> Result<IngestOutcome, Error> {
        self.ingest_cancellable(envelope, &CancellationToken::new())
    }

    /// Ingest one envelope, giving up early if `cancel` fires before the key
    /// is consulted
    pub fn ingest_cancellable(
        &self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, Error> {
        let key = envelope.key();

        let now = self.store.now_millis();
        let mutation =
            match validate_envelope(&envelope, now, &self.config, self.authorizer.as_ref()) {
                Ok(mutation) => mutation,
                Err(error) => {
                    tracing::warn!(
                        target: "courier_core::pipeline::ingest",
                        "Rejected {} envelope for {}: {}",
                        envelope.kind,
                        key,
                        error
                    );
                    return Ok(IngestOutcome::Rejected {
                        key,
                        reason: RejectReason::Invalid { error },
                    });
                }
            };

        if cancel.is_cancelled() {
            return Ok(IngestOutcome::Cancelled { key });
        }

        let guard = self.store.lock(&key);

        if cancel.is_cancelled() {
            return Ok(IngestOutcome::Cancelled { key });
        }

        let outcome = self.apply_locked(&guard, envelope, mutation).inspect_err(|e| {
            tracing::error!(
                target: "courier_core::pipeline::ingest",
                "Storage failure while ingesting {}: {}",
                key,
                e
            );
        })?;

        // A re-delivered New also retries envelopes a failed replay left behind
        if matches!(
            outcome,
            IngestOutcome::Inserted { .. }
                | IngestOutcome::Duplicate {
                    reason: DuplicateReason::AlreadyPresent,
                    ..
                }
        ) {
            self.replay_deferred(&guard);
        }

        Ok(outcome)
    }

    /// Ingest a batch of envelopes.
    ///
    /// Envelopes are grouped per key, keeping arrival order inside each group.
    /// Groups are drained by up to `batch_workers` threads. The returned vector
    /// lines up with the input.
    pub fn ingest_batch(&self, envelopes: Vec<Envelope>) -> Vec<Result<IngestOutcome, Error>> {
        self.ingest_batch_cancellable(envelopes, &CancellationToken::new())
    }

    /// [`IngestionPipeline::ingest_batch`] with cancellation.
    ///
    /// Envelopes not yet started when `cancel` fires come back as
    /// [`IngestOutcome::Cancelled`].
    pub fn ingest_batch_cancellable(
        &self,
        envelopes: Vec<Envelope>,
        cancel: &CancellationToken,
    ) -> Vec<Result<IngestOutcome, Error>> {
        let total = envelopes.len();
        let groups = group_by_key(envelopes);
        let workers = self.config.batch_workers.clamp(1, groups.len().max(1));

        tracing::debug!(
            target: "courier_core::pipeline::ingest_batch",
            "Ingesting {} envelopes in {} key groups with {} workers",
            total,
            groups.len(),
            workers
        );

        let mut results: Vec<(usize, Result<IngestOutcome, Error>)> = if workers == 1 {
            groups
                .into_iter()
                .flat_map(|group| self.ingest_group(group, cancel))
                .collect()
        } else {
            let queue = Mutex::new(groups.into_iter());
            thread::scope(|scope| {
                let handles: Vec<_> = (0..workers)
                    .map(|_| {
                        scope.spawn(|| {
                            let mut done = Vec::new();
                            loop {
                                let next = queue.lock().next();
                                let Some(group) = next else {
                                    break;
                                };
                                done.extend(self.ingest_group(group, cancel));
                            }
                            done
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .flat_map(|handle| match handle.join() {
                        Ok(done) => done,
                        Err(panic) => std::panic::resume_unwind(panic),
                    })
                    .collect()
            })
        };

        results.sort_by_key(|(position, _)| *position);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn ingest_group(
        &self,
        group: Vec<(usize, Envelope)>,
        cancel: &CancellationToken,
    ) -> Vec<(usize, Result<IngestOutcome, Error>)> {
        group
            .into_iter()
            .map(|(position, envelope)| (position, self.ingest_cancellable(envelope, cancel)))
            .collect()
    }

    /// Classify and apply `envelope`; the caller holds the key lock.
    fn apply_locked(
        &self,
        guard: &KeyGuard<'_, S>,
        envelope: Envelope,
        mutation: Mutation,
    ) -> Result<IngestOutcome, Error> {
        match mutation {
            Mutation::New { body } => self.apply_new(guard, &envelope, body),
            Mutation::Edit { revision, body } => self.apply_edit(guard, envelope, revision, body),
            Mutation::Delete => self.apply_delete(guard, envelope),
        }
    }

    fn apply_new(
        &self,
        guard: &KeyGuard<'_, S>,
        envelope: &Envelope,
        body: Body,
    ) -> Result<IngestOutcome, Error> {
        let key = guard.key().clone();

        if self.index.contains(&key) {
            tracing::debug!(
                target: "courier_core::pipeline::apply_new",
                "Duplicate delivery of {}",
                key
            );
            return Ok(IngestOutcome::Duplicate {
                key,
                reason: DuplicateReason::AlreadyPresent,
            });
        }

        let record = envelope.to_new_record(body, self.store.now_millis());

        match guard.append(record)? {
            AppendResult::Appended(record) => {
                if let InsertOutcome::AlreadyPresent(_) =
                    self.index.insert_if_absent(key.clone(), Handle::from_record(&record))
                {
                    self.index.update(key.clone(), Handle::from_record(&record));
                }
                tracing::debug!(
                    target: "courier_core::pipeline::apply_new",
                    "Inserted {} as record {}",
                    key,
                    record.record_id
                );
                self.emit(ChangeKind::Inserted, &record);
                Ok(IngestOutcome::Inserted { record })
            }
            AppendResult::AlreadyExists(existing) => {
                // Another writer on the same storage got there first
                self.index.update(key.clone(), Handle::from_record(&existing));
                tracing::debug!(
                    target: "courier_core::pipeline::apply_new",
                    "Lost append race for {}, keeping record {}",
                    key,
                    existing.record_id
                );
                Ok(IngestOutcome::Duplicate {
                    key,
                    reason: DuplicateReason::AlreadyPresent,
                })
            }
        }
    }

    fn apply_edit(
        &self,
        guard: &KeyGuard<'_, S>,
        envelope: Envelope,
        revision: u32,
        body: Body,
    ) -> Result<IngestOutcome, Error> {
        let key = guard.key().clone();

        if let Some(handle) = self.index.lookup(&key) {
            if handle.is_deleted {
                return Ok(self.reject_edit_after_delete(key));
            }
            if revision <= handle.revision {
                return Ok(stale(key, handle.revision));
            }
        }

        match guard.apply_edit(revision, body.clone())? {
            EditOutcome::Applied(record) => {
                self.index.update(key.clone(), Handle::from_record(&record));
                tracing::debug!(
                    target: "courier_core::pipeline::apply_edit",
                    "Applied revision {} to {}",
                    revision,
                    key
                );
                self.emit(ChangeKind::Edited, &record);
                Ok(IngestOutcome::Edited { record })
            }
            EditOutcome::Rejected(EditRejection::Stale { current }) => Ok(stale(key, current)),
            EditOutcome::Rejected(EditRejection::Tombstoned) => {
                Ok(self.reject_edit_after_delete(key))
            }
            EditOutcome::Rejected(EditRejection::NotFound) => {
                Ok(self.defer(envelope, Mutation::Edit { revision, body }))
            }
        }
    }

    fn apply_delete(
        &self,
        guard: &KeyGuard<'_, S>,
        envelope: Envelope,
    ) -> Result<IngestOutcome, Error> {
        let key = guard.key().clone();

        if self.index.lookup(&key).is_some_and(|handle| handle.is_deleted) {
            return Ok(IngestOutcome::Duplicate {
                key,
                reason: DuplicateReason::AlreadyDeleted,
            });
        }

        match guard.apply_delete()? {
            DeleteOutcome::Applied(record) => {
                self.index.update(key.clone(), Handle::from_record(&record));
                tracing::debug!(
                    target: "courier_core::pipeline::apply_delete",
                    "Tombstoned {}",
                    key
                );
                self.emit(ChangeKind::Deleted, &record);
                Ok(IngestOutcome::Deleted { record })
            }
            DeleteOutcome::Rejected(DeleteRejection::AlreadyDeleted(record)) => {
                self.index.update(key.clone(), Handle::from_record(&record));
                Ok(IngestOutcome::Duplicate {
                    key,
                    reason: DuplicateReason::AlreadyDeleted,
                })
            }
            DeleteOutcome::Rejected(DeleteRejection::NotFound) => {
                Ok(self.defer(envelope, Mutation::Delete))
            }
        }
    }

    fn reject_edit_after_delete(&self, key: MessageKey) -> IngestOutcome {
        tracing::warn!(
            target: "courier_core::pipeline::apply_edit",
            "Rejected edit of deleted message {}",
            key
        );
        IngestOutcome::Rejected {
            key,
            reason: RejectReason::EditAfterDelete,
        }
    }

    fn defer(&self, envelope: Envelope, mutation: Mutation) -> IngestOutcome {
        let key = envelope.key();
        tracing::warn!(
            target: "courier_core::pipeline::defer",
            "No message for {} {}, deferring",
            envelope.kind,
            key
        );
        self.deferred.defer(envelope, mutation, self.store.now_millis());
        IngestOutcome::Deferred { key }
    }

    /// Apply envelopes parked for the guarded key, in arrival order. On a
    /// storage failure the failed envelope and everything after it go back
    /// into the buffer. Returns how many were replayed.
    fn replay_deferred(&self, guard: &KeyGuard<'_, S>) -> usize {
        let parked = self.deferred.take(guard.key());
        if parked.is_empty() {
            return 0;
        }

        tracing::debug!(
            target: "courier_core::pipeline::replay_deferred",
            "Replaying {} deferred envelope(s) for {}",
            parked.len(),
            guard.key()
        );

        let mut replayed = 0;
        let mut parked = parked.into_iter();
        while let Some(deferred) = parked.next() {
            let result =
                self.apply_locked(guard, deferred.envelope.clone(), deferred.mutation.clone());
            match result {
                Ok(outcome) => {
                    replayed += 1;
                    tracing::debug!(
                        target: "courier_core::pipeline::replay_deferred",
                        "Deferred envelope for {} {}",
                        guard.key(),
                        outcome.as_str()
                    );
                }
                Err(e) => {
                    let remaining: Vec<_> =
                        std::iter::once(deferred).chain(parked.by_ref()).collect();
                    tracing::error!(
                        target: "courier_core::pipeline::replay_deferred",
                        "Storage failure replaying deferred envelope for {}, keeping {} parked: {}",
                        guard.key(),
                        remaining.len(),
                        e
                    );
                    self.deferred.restore(guard.key(), remaining);
                    break;
                }
            }
        }
        replayed
    }

    fn emit(&self, kind: ChangeKind, record: &MessageRecord) {
        self.notifier.notify(&Change {
            key: record.key.clone(),
            kind,
            record: record.clone(),
        });
    }
}

fn stale(key: MessageKey, current: u32) -> IngestOutcome {
    tracing::debug!(
        target: "courier_core::pipeline::apply_edit",
        "Stale edit for {} (current revision {})",
        key,
        current
    );
    IngestOutcome::Duplicate {
        key,
        reason: DuplicateReason::StaleRevision { current },
    }
}

/// Group envelopes by key, keeping first-seen group order and arrival order
/// inside each group. Each envelope keeps its input position.
fn group_by_key(envelopes: Vec<Envelope>) -> Vec<Vec<(usize, Envelope)>> {
    let mut slots: HashMap<MessageKey, usize> = HashMap::new();
    let mut groups: Vec<Vec<(usize, Envelope)>> = Vec::new();

    for (position, envelope) in envelopes.into_iter().enumerate() {
        let slot = *slots.entry(envelope.key()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push((position, envelope));
    }

    groups
}
