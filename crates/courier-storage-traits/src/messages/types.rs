//! Types for the messages module

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::MessageError;
use crate::ids::{AuthorId, ConversationId};

/// Identity of one logical message.
///
/// Every delivery of the same message, whatever transport path it took, carries
/// the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    /// Conversation the message belongs to
    pub conversation_id: ConversationId,
    /// Author of the message
    pub author_id: AuthorId,
    /// Timestamp assigned by the sending device
    pub source_timestamp: u64,
}

impl MessageKey {
    /// Construct a key
    pub fn new(conversation_id: ConversationId, author_id: AuthorId, source_timestamp: u64) -> Self {
        Self {
            conversation_id,
            author_id,
            source_timestamp,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.conversation_id, self.author_id, self.source_timestamp
        )
    }
}

/// Backend-assigned record identifier, unique within one store
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A styled or mention range inside a text body
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyRange {
    /// Start offset in UTF-16 code units
    pub start: u32,
    /// Length in UTF-16 code units
    pub length: u32,
    /// What the range means
    pub style: RangeStyle,
}

/// Meaning of a [`BodyRange`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeStyle {
    /// Mention of another account
    Mention(AuthorId),
    #[allow(missing_docs)]
    Bold,
    #[allow(missing_docs)]
    Italic,
    #[allow(missing_docs)]
    Spoiler,
    #[allow(missing_docs)]
    Strikethrough,
    #[allow(missing_docs)]
    Monospace,
}

/// Reference to the story a reply or reaction targets
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoryRef {
    /// Author of the story
    pub author_id: AuthorId,
    /// Source timestamp of the story
    pub timestamp: u64,
}

/// Payment notification attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentNotification {
    /// Optional note typed by the sender
    pub note: Option<String>,
    /// Opaque receipt, verified by the payments subsystem
    pub receipt: Vec<u8>,
}

/// Gifted badge attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GiftBadge {
    /// Opaque receipt credential presentation
    pub receipt_credential_presentation: Vec<u8>,
}

/// Message content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Plain text with optional mention/style ranges
    Text {
        /// The text
        text: String,
        /// Mention and style ranges
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ranges: Vec<BodyRange>,
    },
    /// Text reply to a story
    StoryReply {
        /// Story being replied to
        story: StoryRef,
        /// Reply text
        text: String,
    },
    /// Emoji reaction to a story
    StoryReaction {
        /// Story being reacted to
        story: StoryRef,
        /// Reaction emoji
        emoji: String,
    },
    /// Payment notification
    Payment(PaymentNotification),
    /// Gift badge
    GiftBadge(GiftBadge),
}

impl Body {
    /// Plain text body without ranges
    pub fn text<S>(text: S) -> Self
    where
        S: Into<String>,
    {
        Self::Text {
            text: text.into(),
            ranges: Vec::new(),
        }
    }

    /// Short name of the variant, for logs and storage columns
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::StoryReply { .. } => "story_reply",
            Self::StoryReaction { .. } => "story_reaction",
            Self::Payment(_) => "payment",
            Self::GiftBadge(_) => "gift_badge",
        }
    }

    /// Number of payload bytes carried by the body, used for size limits
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Text { text, ranges } => text.len() + ranges.len() * 8,
            Self::StoryReply { text, .. } => text.len(),
            Self::StoryReaction { emoji, .. } => emoji.len(),
            Self::Payment(payment) => {
                payment.note.as_ref().map_or(0, String::len) + payment.receipt.len()
            }
            Self::GiftBadge(badge) => badge.receipt_credential_presentation.len(),
        }
    }

    /// Text shown to the user, if the body has any
    pub fn display_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } | Self::StoryReply { text, .. } => Some(text),
            Self::StoryReaction { emoji, .. } => Some(emoji),
            Self::Payment(payment) => payment.note.as_deref(),
            Self::GiftBadge(_) => None,
        }
    }
}

/// Flags describing how a message reached this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeliveryFlag {
    /// Received through sealed sender (unidentified delivery)
    SealedSender,
    /// View-once message
    ViewOnce,
    /// Already read on another device
    Read,
    /// Synced from one of our linked devices
    LinkedDeviceSync,
}

impl fmt::Display for DeliveryFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl DeliveryFlag {
    /// Get as `&str`
    pub fn as_str(&self) -> &str {
        match self {
            Self::SealedSender => "sealed_sender",
            Self::ViewOnce => "view_once",
            Self::Read => "read",
            Self::LinkedDeviceSync => "linked_device_sync",
        }
    }
}

impl FromStr for DeliveryFlag {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sealed_sender" => Ok(Self::SealedSender),
            "view_once" => Ok(Self::ViewOnce),
            "read" => Ok(Self::Read),
            "linked_device_sync" => Ok(Self::LinkedDeviceSync),
            _ => Err(MessageError::InvalidParameters(format!(
                "Invalid delivery flag: {}",
                s
            ))),
        }
    }
}

impl Serialize for DeliveryFlag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeliveryFlag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A record that has not been appended yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessageRecord {
    /// Message identity
    pub key: MessageKey,
    /// Local monotonic receive time in milliseconds
    pub received_at: u64,
    /// Server timestamp. Metadata only, never used for ordering.
    pub server_timestamp: u64,
    /// Time the server handed the message to this device
    pub server_delivery_timestamp: u64,
    /// Server-assigned GUID, when known
    pub server_guid: Option<String>,
    /// Original body
    pub body: Body,
    /// Delivery flags
    pub delivery_flags: BTreeSet<DeliveryFlag>,
    /// Disappearing-message timer, 0 when disabled
    pub expires_in_secs: u32,
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Backend-assigned id
    pub record_id: RecordId,
    /// Message identity
    pub key: MessageKey,
    /// Local monotonic receive time in milliseconds
    pub received_at: u64,
    /// Server timestamp. Metadata only, never used for ordering.
    pub server_timestamp: u64,
    /// Time the server handed the message to this device
    pub server_delivery_timestamp: u64,
    /// Server-assigned GUID, when known
    pub server_guid: Option<String>,
    /// Number of accepted edits. 0 for the original body.
    pub revision: u32,
    /// Current body
    pub body: Body,
    /// Delivery flags
    pub delivery_flags: BTreeSet<DeliveryFlag>,
    /// Disappearing-message timer, 0 when disabled
    pub expires_in_secs: u32,
    /// Tombstone marker
    pub is_deleted: bool,
}

impl MessageRecord {
    /// Build the stored form of a freshly appended record
    pub fn from_new(record_id: RecordId, new: NewMessageRecord) -> Self {
        Self {
            record_id,
            key: new.key,
            received_at: new.received_at,
            server_timestamp: new.server_timestamp,
            server_delivery_timestamp: new.server_delivery_timestamp,
            server_guid: new.server_guid,
            revision: 0,
            body: new.body,
            delivery_flags: new.delivery_flags,
            expires_in_secs: new.expires_in_secs,
            is_deleted: false,
        }
    }

    /// Position of this record in its conversation log
    pub fn position(&self) -> LogPosition {
        LogPosition {
            received_at: self.received_at,
            source_timestamp: self.key.source_timestamp,
            record_id: self.record_id,
        }
    }
}

/// Position of a record inside its conversation log.
///
/// Positions order by `received_at`, then `source_timestamp`, then
/// `record_id`. Every backend returns conversation logs in this order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    /// Local receive time
    pub received_at: u64,
    /// Source timestamp of the record key
    pub source_timestamp: u64,
    /// Record id, tiebreaker
    pub record_id: RecordId,
}

/// Resumable read position in a conversation log
///
/// A cursor is plain data: save it anywhere and hand it back to resume a
/// stream exactly after the last record that was read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    after: Option<LogPosition>,
}

impl Cursor {
    /// Cursor positioned before the first record
    pub const fn start() -> Self {
        Self { after: None }
    }

    /// Cursor positioned right after `record`
    pub fn after(record: &MessageRecord) -> Self {
        Self {
            after: Some(record.position()),
        }
    }

    /// Last position already read, if any
    pub fn position(&self) -> Option<LogPosition> {
        self.after
    }

    /// Whether the cursor is at the start of the log
    pub fn is_start(&self) -> bool {
        self.after.is_none()
    }
}

/// Outcome of [`MessageStorage::append_message`](super::MessageStorage::append_message)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendResult {
    /// The record was appended
    Appended(MessageRecord),
    /// A record already existed for the key; nothing was written
    AlreadyExists(MessageRecord),
}

/// Outcome of [`MessageStorage::apply_revision`](super::MessageStorage::apply_revision)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionResult {
    /// The revision was applied; the updated record is returned
    Applied(MessageRecord),
    /// The stored revision is greater or equal
    Stale {
        /// Revision currently stored
        current: u32,
    },
    /// The record is a tombstone
    Tombstoned,
    /// No record exists for the key
    NotFound,
}

/// Outcome of [`MessageStorage::mark_deleted`](super::MessageStorage::mark_deleted)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteResult {
    /// The record is now a tombstone
    Applied(MessageRecord),
    /// The record was already a tombstone
    AlreadyDeleted(MessageRecord),
    /// No record exists for the key
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ts: u64) -> MessageKey {
        MessageKey::new(
            ConversationId::from_slice(&[1]),
            AuthorId::from_slice(&[2]),
            ts,
        )
    }

    fn record(id: u64, received_at: u64, ts: u64) -> MessageRecord {
        MessageRecord::from_new(
            RecordId::new(id),
            NewMessageRecord {
                key: key(ts),
                received_at,
                server_timestamp: 0,
                server_delivery_timestamp: 0,
                server_guid: None,
                body: Body::text("hi"),
                delivery_flags: BTreeSet::new(),
                expires_in_secs: 0,
            },
        )
    }

    #[test]
    fn test_log_order_received_at_first() {
        let earlier = record(2, 10, 500);
        let later = record(1, 20, 100);
        assert!(earlier.position() < later.position());
    }

    #[test]
    fn test_log_order_tiebreakers() {
        let a = record(5, 10, 100);
        let b = record(1, 10, 200);
        assert!(a.position() < b.position());

        let c = record(1, 10, 100);
        let d = record(2, 10, 100);
        assert!(c.position() < d.position());
    }

    #[test]
    fn test_cursor_after_record() {
        let first = record(1, 10, 100);

        assert!(Cursor::start().is_start());
        assert_eq!(Cursor::start().position(), None);
        let cursor = Cursor::after(&first);
        assert_eq!(cursor.position(), Some(first.position()));
        assert!(!cursor.is_start());
    }

    #[test]
    fn test_from_new_starts_at_revision_zero() {
        let r = record(7, 1, 1);
        assert_eq!(r.revision, 0);
        assert!(!r.is_deleted);
        assert_eq!(r.record_id.as_u64(), 7);
    }

    #[test]
    fn test_delivery_flag_from_str() {
        assert_eq!(
            DeliveryFlag::from_str("sealed_sender").unwrap(),
            DeliveryFlag::SealedSender
        );
        assert_eq!(
            DeliveryFlag::from_str("linked_device_sync").unwrap(),
            DeliveryFlag::LinkedDeviceSync
        );
        assert!(DeliveryFlag::from_str("bogus").is_err());
    }

    #[test]
    fn test_body_serialization_is_tagged() {
        let body = Body::text("hello");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
        assert!(json.get("ranges").is_none());

        let payment = Body::Payment(PaymentNotification {
            note: Some("rent".to_string()),
            receipt: vec![1, 2, 3],
        });
        let json = serde_json::to_string(&payment).unwrap();
        let back: Body = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payment);
        assert_eq!(back.kind_str(), "payment");
    }

    #[test]
    fn test_body_payload_len_and_display_text() {
        let reaction = Body::StoryReaction {
            story: StoryRef {
                author_id: AuthorId::from_slice(&[9]),
                timestamp: 5,
            },
            emoji: "👍".to_string(),
        };
        assert_eq!(reaction.payload_len(), "👍".len());
        assert_eq!(reaction.display_text(), Some("👍"));

        let badge = Body::GiftBadge(GiftBadge {
            receipt_credential_presentation: vec![0; 16],
        });
        assert_eq!(badge.payload_len(), 16);
        assert_eq!(badge.display_text(), None);
    }

    #[test]
    fn test_message_key_display() {
        let k = MessageKey::new(
            ConversationId::from_slice(&[0xaa]),
            AuthorId::from_slice(&[0xbb]),
            42,
        );
        assert_eq!(k.to_string(), "aa/bb/42");
    }
}
