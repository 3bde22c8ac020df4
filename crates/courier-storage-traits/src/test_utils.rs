//! Helpers for building keys and records in tests

use std::collections::BTreeSet;

use crate::ids::{AuthorId, ConversationId};
use crate::messages::types::{Body, MessageKey, NewMessageRecord};

/// Conversation id derived from a short label
pub fn conversation(label: &str) -> ConversationId {
    ConversationId::from_slice(label.as_bytes())
}

/// Author id derived from a short label
pub fn author(label: &str) -> AuthorId {
    AuthorId::from_slice(label.as_bytes())
}

/// Key for `label`-named conversation and author
pub fn key(conversation_label: &str, author_label: &str, source_timestamp: u64) -> MessageKey {
    MessageKey::new(
        conversation(conversation_label),
        author(author_label),
        source_timestamp,
    )
}

/// New text record for `key` received at `received_at`
pub fn new_text_record(key: MessageKey, text: &str, received_at: u64) -> NewMessageRecord {
    NewMessageRecord {
        server_timestamp: key.source_timestamp,
        server_delivery_timestamp: key.source_timestamp,
        key,
        received_at,
        server_guid: None,
        body: Body::text(text),
        delivery_flags: BTreeSet::new(),
        expires_in_secs: 0,
    }
}
