//! Courier storage - storage traits and types for the incoming-message ingestion core.
//!
//! A storage backend owns durable message records, their edit chains and
//! tombstones. Backends only promise atomic read-modify-write for a single
//! [`MessageKey`](messages::types::MessageKey); ordering between keys and the
//! serialization of concurrent writers for the same key live in `courier-core`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::sync::Arc;

pub mod ids;
pub mod messages;
#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use ids::{AuthorId, ConversationId};

use self::messages::MessageStorage;
use self::messages::edit_chain::{EditChain, EditEntry};
use self::messages::error::MessageError;
use self::messages::types::{
    AppendResult, Cursor, DeleteResult, MessageKey, MessageRecord, NewMessageRecord,
    RevisionResult,
};

/// Backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Memory
    Memory,
    /// SQLite
    SQLite,
}

impl Backend {
    /// Check if it's a persistent backend
    ///
    /// All values different from [`Backend::Memory`] are considered persistent
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

impl<T> MessageStorage for Arc<T>
where
    T: MessageStorage + ?Sized,
{
    fn backend(&self) -> Backend {
        (**self).backend()
    }

    fn append_message(&self, record: NewMessageRecord) -> Result<AppendResult, MessageError> {
        (**self).append_message(record)
    }

    fn find_message(&self, key: &MessageKey) -> Result<Option<MessageRecord>, MessageError> {
        (**self).find_message(key)
    }

    fn apply_revision(
        &self,
        key: &MessageKey,
        entry: EditEntry,
    ) -> Result<RevisionResult, MessageError> {
        (**self).apply_revision(key, entry)
    }

    fn mark_deleted(&self, key: &MessageKey) -> Result<DeleteResult, MessageError> {
        (**self).mark_deleted(key)
    }

    fn find_edit_chain(&self, key: &MessageKey) -> Result<Option<EditChain>, MessageError> {
        (**self).find_edit_chain(key)
    }

    fn messages_after(
        &self,
        conversation_id: &ConversationId,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MessageError> {
        (**self).messages_after(conversation_id, cursor, limit)
    }

    fn conversations(&self) -> Result<Vec<ConversationId>, MessageError> {
        (**self).conversations()
    }

    fn latest_received_at(&self) -> Result<Option<u64>, MessageError> {
        (**self).latest_received_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_is_persistent() {
        assert!(!Backend::Memory.is_persistent());
        assert!(Backend::SQLite.is_persistent());
    }
}
