//! Messages module
//!
//! This module is responsible for storing and retrieving message records.
//!
//! Records are addressed by [`MessageKey`] and kept in a per-conversation log
//! ordered by `(received_at, source_timestamp, record_id)`. Records are never
//! physically removed: deletes leave a tombstone so that the key keeps
//! deduplicating after a restart.

use crate::Backend;
use crate::ids::ConversationId;

pub mod edit_chain;
pub mod error;
pub mod types;

use self::edit_chain::{EditChain, EditEntry};
use self::error::MessageError;
use self::types::*;

/// Storage traits for the messages module
///
/// Every mutating method is an atomic read-modify-write of exactly one key.
/// Implementations must never leave a record half-updated (for example a new
/// revision without its edit-chain entry).
pub trait MessageStorage: Send + Sync {
    /// Returns the backend type.
    fn backend(&self) -> Backend;

    /// Append a new record to its conversation log.
    ///
    /// The backend assigns the [`RecordId`]. If a record already exists for the
    /// key, nothing is written and the existing record is returned as
    /// [`AppendResult::AlreadyExists`].
    ///
    /// The log is append-only: when `record.received_at` is not greater than the
    /// `received_at` of the conversation's last record, it is raised to one past
    /// it. The stored value is the one returned in [`AppendResult::Appended`].
    fn append_message(&self, record: NewMessageRecord) -> Result<AppendResult, MessageError>;

    /// Find a record by key, tombstones included
    fn find_message(&self, key: &MessageKey) -> Result<Option<MessageRecord>, MessageError>;

    /// Apply a new revision to an existing record.
    ///
    /// The record body and revision are replaced and `entry` is appended to the
    /// edit chain, only if `entry.revision` is strictly greater than the stored
    /// revision and the record is not a tombstone.
    fn apply_revision(
        &self,
        key: &MessageKey,
        entry: EditEntry,
    ) -> Result<RevisionResult, MessageError>;

    /// Mark a record as deleted, keeping its key and history
    fn mark_deleted(&self, key: &MessageKey) -> Result<DeleteResult, MessageError>;

    /// Full edit history for a record, revision 0 first
    fn find_edit_chain(&self, key: &MessageKey) -> Result<Option<EditChain>, MessageError>;

    /// Page through a conversation log.
    ///
    /// Returns at most `limit` records positioned strictly after `cursor`, in
    /// log order.
    fn messages_after(
        &self,
        conversation_id: &ConversationId,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MessageError>;

    /// All conversations that have at least one record
    fn conversations(&self) -> Result<Vec<ConversationId>, MessageError>;

    /// Highest `received_at` across all records, used to seed the local clock
    fn latest_received_at(&self) -> Result<Option<u64>, MessageError>;
}
