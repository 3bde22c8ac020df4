//! Memory-based storage implementation for Courier.
//!
//! This crate provides an in-memory implementation of the
//! [`MessageStorage`](courier_storage_traits::messages::MessageStorage) trait.
//!
//! Memory-based storage is non-persistent and will be cleared when the
//! application terminates. It's useful for tests, for ephemeral clients, and for
//! simulating crashes: a [`MemoryStorageSnapshot`] taken at any point can be
//! loaded into a fresh storage to model a process restart.
//!
//! ## Memory Exhaustion Protection
//!
//! Input sizes are validated against [`ValidationLimits`]:
//!
//! - [`DEFAULT_MAX_BODY_BYTES`]: maximum body payload size
//! - [`DEFAULT_MAX_SERVER_GUID_LENGTH`]: maximum server GUID length
//!
//! ```rust
//! use courier_memory_storage::{CourierMemoryStorage, ValidationLimits};
//!
//! let limits = ValidationLimits::default().with_max_body_bytes(64 * 1024);
//! let storage = CourierMemoryStorage::with_limits(limits);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use courier_storage_traits::ConversationId;
use courier_storage_traits::messages::edit_chain::EditChain;
use courier_storage_traits::messages::types::{LogPosition, MessageKey, MessageRecord};
use parking_lot::RwLock;

mod messages;
mod snapshot;

pub use self::snapshot::MemoryStorageSnapshot;

/// Default maximum body payload size in bytes (1 MB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Default maximum length of a server GUID in bytes
pub const DEFAULT_MAX_SERVER_GUID_LENGTH: usize = 128;

/// Configurable validation limits for memory storage.
#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    /// Maximum body payload size in bytes
    pub max_body_bytes: usize,
    /// Maximum server GUID length in bytes
    pub max_server_guid_length: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_server_guid_length: DEFAULT_MAX_SERVER_GUID_LENGTH,
        }
    }
}

impl ValidationLimits {
    /// Creates a new `ValidationLimits` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum body payload size in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        assert!(limit > 0, "max_body_bytes must be greater than 0");
        self.max_body_bytes = limit;
        self
    }

    /// Sets the maximum server GUID length in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn with_max_server_guid_length(mut self, limit: usize) -> Self {
        assert!(limit > 0, "max_server_guid_length must be greater than 0");
        self.max_server_guid_length = limit;
        self
    }
}

/// A memory-based storage implementation for Courier.
///
/// ## Thread Safety
///
/// All state sits behind one `RwLock`: reads (`find_message`,
/// `messages_after`, ...) run concurrently and every mutation holds the write
/// lock for its whole read-modify-write, which makes each per-key operation
/// atomic.
pub struct CourierMemoryStorage {
    limits: ValidationLimits,
    inner: RwLock<CourierMemoryStorageInner>,
}

#[derive(Clone, Default)]
struct CourierMemoryStorageInner {
    next_record_id: u64,
    records: HashMap<MessageKey, MessageRecord>,
    /// Per-conversation log, ordered by log position
    logs: HashMap<ConversationId, BTreeMap<LogPosition, MessageKey>>,
    edit_chains: HashMap<MessageKey, EditChain>,
}

impl fmt::Debug for CourierMemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CourierMemoryStorage")
            .field("limits", &self.limits)
            .field("inner", &"RwLock<CourierMemoryStorageInner>")
            .finish()
    }
}

impl Default for CourierMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CourierMemoryStorage {
    /// Creates a new `CourierMemoryStorage` with the default limits.
    pub fn new() -> Self {
        Self::with_limits(ValidationLimits::default())
    }

    /// Creates a new `CourierMemoryStorage` with the provided validation limits.
    pub fn with_limits(limits: ValidationLimits) -> Self {
        Self {
            limits,
            inner: RwLock::new(CourierMemoryStorageInner {
                next_record_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Returns the validation limits in use.
    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Creates a snapshot of all in-memory state.
    ///
    /// Acquires the read lock, so the snapshot is consistent even while other
    /// threads keep reading.
    pub fn create_snapshot(&self) -> MemoryStorageSnapshot {
        let inner = self.inner.read();
        MemoryStorageSnapshot::capture(&inner)
    }

    /// Replaces all current state with the state from `snapshot`.
    pub fn restore_snapshot(&self, snapshot: MemoryStorageSnapshot) {
        let mut inner = self.inner.write();
        *inner = snapshot.into_inner();
    }

    /// Builds a fresh storage holding the state of `snapshot`.
    ///
    /// This is the in-memory equivalent of reopening a database file after a
    /// crash.
    pub fn from_snapshot(snapshot: MemoryStorageSnapshot, limits: ValidationLimits) -> Self {
        Self {
            limits,
            inner: RwLock::new(snapshot.into_inner()),
        }
    }

    /// Total number of records, tombstones included
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Whether the storage holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
