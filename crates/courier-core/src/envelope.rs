//! Decrypted message envelopes handed over by the transport layer

use std::collections::BTreeSet;
use std::fmt;

use courier_storage_traits::messages::types::{Body, DeliveryFlag, MessageKey, NewMessageRecord};
use courier_storage_traits::{AuthorId, ConversationId};
use serde::{Deserialize, Serialize};

/// What an envelope asks to do with its message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// First delivery of a message
    New,
    /// Replacement body for an existing message
    Edit,
    /// Deletion of an existing message
    Delete,
}

impl EnvelopeKind {
    /// Get as `&str`
    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "new",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport path the envelope took
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySource {
    /// Normal delivery from the server
    #[default]
    Direct,
    /// Sent by one of our own linked devices
    LinkedDeviceSync,
    /// Re-delivered after an earlier failure
    Retry,
}

/// A decrypted incoming envelope.
///
/// Every field the transport knows is carried explicitly; optional metadata
/// defaults to "absent" when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// Author of the message
    pub author_id: AuthorId,
    /// Timestamp assigned by the sending device
    pub source_timestamp: u64,
    /// Server timestamp
    #[serde(default)]
    pub server_timestamp: u64,
    /// Time the server handed the envelope to this device
    #[serde(default)]
    pub server_delivery_timestamp: u64,
    /// Server-assigned GUID
    #[serde(default)]
    pub server_guid: Option<String>,
    /// What to do
    pub kind: EnvelopeKind,
    /// Edit revision, required for [`EnvelopeKind::Edit`]
    #[serde(default)]
    pub revision: Option<u32>,
    /// Body, required for [`EnvelopeKind::New`] and [`EnvelopeKind::Edit`]
    #[serde(default)]
    pub body: Option<Body>,
    /// Transport path
    #[serde(default)]
    pub source: DeliverySource,
    /// Delivery flags reported by the transport
    #[serde(default)]
    pub flags: BTreeSet<DeliveryFlag>,
    /// Disappearing-message timer, 0 when disabled
    #[serde(default)]
    pub expires_in_secs: u32,
}

impl Envelope {
    /// New-message envelope with no optional metadata
    pub fn new_message(
        conversation_id: ConversationId,
        author_id: AuthorId,
        source_timestamp: u64,
        body: Body,
    ) -> Self {
        Self {
            conversation_id,
            author_id,
            source_timestamp,
            server_timestamp: 0,
            server_delivery_timestamp: 0,
            server_guid: None,
            kind: EnvelopeKind::New,
            revision: None,
            body: Some(body),
            source: DeliverySource::Direct,
            flags: BTreeSet::new(),
            expires_in_secs: 0,
        }
    }

    /// Edit envelope targeting `(conversation_id, author_id, source_timestamp)`
    pub fn edit(
        conversation_id: ConversationId,
        author_id: AuthorId,
        source_timestamp: u64,
        revision: u32,
        body: Body,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Edit,
            revision: Some(revision),
            ..Self::new_message(conversation_id, author_id, source_timestamp, body)
        }
    }

    /// Delete envelope targeting `(conversation_id, author_id, source_timestamp)`
    pub fn delete(
        conversation_id: ConversationId,
        author_id: AuthorId,
        source_timestamp: u64,
    ) -> Self {
        Self {
            conversation_id,
            author_id,
            source_timestamp,
            server_timestamp: 0,
            server_delivery_timestamp: 0,
            server_guid: None,
            kind: EnvelopeKind::Delete,
            revision: None,
            body: None,
            source: DeliverySource::Direct,
            flags: BTreeSet::new(),
            expires_in_secs: 0,
        }
    }

    /// Set the server timestamp
    pub fn with_server_timestamp(mut self, server_timestamp: u64) -> Self {
        self.server_timestamp = server_timestamp;
        self
    }

    /// Set the delivery source
    pub fn with_source(mut self, source: DeliverySource) -> Self {
        self.source = source;
        self
    }

    /// Add a delivery flag
    pub fn with_flag(mut self, flag: DeliveryFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    /// Identity of the message this envelope targets
    pub fn key(&self) -> MessageKey {
        MessageKey::new(
            self.conversation_id.clone(),
            self.author_id.clone(),
            self.source_timestamp,
        )
    }

    /// Flags to store with the record, including the ones implied by the source
    pub fn delivery_flags(&self) -> BTreeSet<DeliveryFlag> {
        let mut flags = self.flags.clone();
        if self.source == DeliverySource::LinkedDeviceSync {
            flags.insert(DeliveryFlag::LinkedDeviceSync);
        }
        flags
    }

    /// Build the record to append for a [`EnvelopeKind::New`] envelope with
    /// its validated `body`
    pub fn to_new_record(&self, body: Body, received_at: u64) -> NewMessageRecord {
        NewMessageRecord {
            key: self.key(),
            received_at,
            server_timestamp: self.server_timestamp,
            server_delivery_timestamp: self.server_delivery_timestamp,
            server_guid: self.server_guid.clone(),
            body,
            delivery_flags: self.delivery_flags(),
            expires_in_secs: self.expires_in_secs,
        }
    }
}
