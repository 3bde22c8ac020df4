//! Courier Public Prelude
//!
//! The types most applications need to feed envelopes in and watch changes
//! come out.
//!
//! ## Usage
//!
//! ```rust
//! use courier_core::prelude::*;
//! use courier_memory_storage::CourierMemoryStorage;
//!
//! let pipeline = IngestionPipeline::new(CourierMemoryStorage::default())?;
//! # Ok::<(), courier_core::Error>(())
//! ```

// === Core Types ===
/// Courier error type
pub use crate::Error;
/// Ingestion configuration
pub use crate::CourierConfig;
/// The ingestion pipeline and its builder
pub use crate::pipeline::{IngestionPipeline, IngestionPipelineBuilder};

// === Inputs ===
/// Envelope types
pub use crate::envelope::{DeliverySource, Envelope, EnvelopeKind};
/// Pluggable authorization
pub use crate::validation::{AllowAll, Authorizer, Mutation, ValidationError};
/// Clocks
pub use crate::clock::{Clock, ManualClock, SystemClock};

// === Results ===
/// Ingestion result types
pub use crate::pipeline::{CancellationToken, DuplicateReason, IngestOutcome, RejectReason};
/// Change notification types
pub use crate::notify::{Change, ChangeKind, ChangeSubscriber, Subscription};

// === Storage Types ===
/// Storage trait and record types
pub use courier_storage_traits::messages::MessageStorage;
pub use courier_storage_traits::messages::types::{
    Body, Cursor, DeliveryFlag, MessageKey, MessageRecord,
};
/// Identifiers
pub use courier_storage_traits::{AuthorId, ConversationId};
