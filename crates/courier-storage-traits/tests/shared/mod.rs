//! Shared test functions run against every storage backend

use std::collections::BTreeSet;

use courier_storage_traits::messages::types::{Body, MessageKey, NewMessageRecord};
use courier_storage_traits::{AuthorId, ConversationId};

pub mod message_tests;

pub fn create_test_key(conversation: &[u8], author: &[u8], source_timestamp: u64) -> MessageKey {
    MessageKey::new(
        ConversationId::from_slice(conversation),
        AuthorId::from_slice(author),
        source_timestamp,
    )
}

pub fn create_test_record(key: MessageKey, text: &str, received_at: u64) -> NewMessageRecord {
    NewMessageRecord {
        server_timestamp: key.source_timestamp + 1,
        server_delivery_timestamp: key.source_timestamp + 2,
        key,
        received_at,
        server_guid: Some("guid-1".to_string()),
        body: Body::text(text),
        delivery_flags: BTreeSet::new(),
        expires_in_secs: 0,
    }
}
