//! Incoming-message ingestion core for Courier
//!
//! This crate turns decrypted envelopes handed over by the transport layer into
//! durable, deduplicated records. It enforces first-writer-wins on message
//! identity, applies edits in revision order, keeps deletes final, and notifies
//! subscribers of every applied change.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod clock;
pub mod dedup_index;
pub mod deferred;
pub mod envelope;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod prelude;
pub mod store;
pub mod validation;

pub use self::error::Error;
pub use self::pipeline::{IngestionPipeline, IngestionPipelineBuilder};

// Re-export identifiers for convenience
pub use courier_storage_traits::{AuthorId, ConversationId};

/// Configuration for ingestion behavior
///
/// All fields have usable defaults.
///
/// # Examples
///
/// ```rust
/// use courier_core::CourierConfig;
///
/// // Use defaults
/// let config = CourierConfig::default();
///
/// // Custom configuration
/// let config = CourierConfig {
///     max_envelope_age_ms: 86_400_000, // 1 day instead of 45
///     batch_workers: 8,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierConfig {
    /// Maximum distance a source timestamp may be ahead of the local clock.
    ///
    /// Default: 300000 (5 minutes)
    pub max_future_skew_ms: u64,

    /// Maximum age of an accepted source timestamp.
    ///
    /// Envelopes older than this are rejected. The window accommodates devices
    /// that were offline for a long time while keeping replays of ancient
    /// traffic out.
    ///
    /// Default: 3888000000 (45 days)
    pub max_envelope_age_ms: u64,

    /// Maximum body payload size in bytes.
    ///
    /// Default: 65536
    pub max_body_bytes: usize,

    /// Maximum server GUID length in bytes.
    ///
    /// Default: 128
    pub max_server_guid_length: usize,

    /// Maximum number of message keys with deferred edits or deletes.
    ///
    /// When full, the least recently touched key is dropped.
    ///
    /// Default: 1024
    pub max_deferred_keys: usize,

    /// Maximum number of deferred envelopes per message key.
    ///
    /// Default: 16
    pub max_deferred_per_key: usize,

    /// Time a deferred edit or delete waits for its message before being
    /// dropped by [`IngestionPipeline::expire_deferred`].
    ///
    /// Default: 600000 (10 minutes)
    pub deferred_ttl_ms: u64,

    /// Number of threads used by [`IngestionPipeline::ingest_batch`].
    ///
    /// Default: 4
    pub batch_workers: usize,

    /// Number of dedup index shards.
    ///
    /// Default: 16
    pub dedup_shards: usize,

    /// Records fetched per storage round trip when streaming a conversation.
    ///
    /// Default: 256
    pub stream_page_size: usize,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            max_future_skew_ms: 300_000,        // 5 minutes
            max_envelope_age_ms: 3_888_000_000, // 45 days
            max_body_bytes: 64 * 1024,
            max_server_guid_length: 128,
            max_deferred_keys: 1024,
            max_deferred_per_key: 16,
            deferred_ttl_ms: 600_000, // 10 minutes
            batch_workers: 4,
            dedup_shards: dedup_index::DedupIndex::DEFAULT_SHARDS,
            stream_page_size: 256,
        }
    }
}

impl CourierConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that every size and count is usable
    pub fn validate(&self) -> Result<(), Error> {
        let counts = [
            ("max_body_bytes", self.max_body_bytes),
            ("max_deferred_keys", self.max_deferred_keys),
            ("max_deferred_per_key", self.max_deferred_per_key),
            ("batch_workers", self.batch_workers),
            ("dedup_shards", self.dedup_shards),
            ("stream_page_size", self.stream_page_size),
        ];

        for (name, value) in counts {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be greater than 0", name)));
            }
        }

        Ok(())
    }
}
