//! Envelope validation
//!
//! Validation is pure: it never touches storage and runs before the per-key
//! lock is taken. A failure is final for that envelope, it is not retried.

use std::fmt;

use courier_storage_traits::messages::types::Body;
use courier_storage_traits::{AuthorId, ConversationId};
use serde::{Deserialize, Serialize};

use crate::CourierConfig;
use crate::envelope::{Envelope, EnvelopeKind};

/// Why an envelope was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ValidationError {
    /// Conversation id is empty
    #[error("conversation id is empty")]
    EmptyConversationId,
    /// Author id is empty
    #[error("author id is empty")]
    EmptyAuthorId,
    /// Source timestamp is zero
    #[error("source timestamp is zero")]
    ZeroTimestamp,
    /// Source timestamp is too far ahead of the local clock
    #[error("source timestamp {timestamp} is more than {max_skew_ms}ms ahead of {now}")]
    TimestampInFuture {
        /// Envelope source timestamp
        timestamp: u64,
        /// Local time
        now: u64,
        /// Allowed skew
        max_skew_ms: u64,
    },
    /// Source timestamp is older than the accepted window
    #[error("source timestamp {timestamp} is more than {max_age_ms}ms older than {now}")]
    TimestampTooOld {
        /// Envelope source timestamp
        timestamp: u64,
        /// Local time
        now: u64,
        /// Accepted age
        max_age_ms: u64,
    },
    /// Author may not post in the conversation
    #[error("author {author_id} is not authorized in conversation {conversation_id}")]
    Unauthorized {
        /// Conversation
        conversation_id: ConversationId,
        /// Author
        author_id: AuthorId,
    },
    /// New or edit envelope without body
    #[error("{kind} envelope has no body")]
    MissingBody {
        /// Envelope kind
        kind: EnvelopeKind,
    },
    /// Delete envelope carrying a body
    #[error("delete envelope carries a body")]
    UnexpectedBody,
    /// Edit envelope without revision
    #[error("edit envelope has no revision")]
    MissingRevision,
    /// Edit revision 0, which is reserved for the original body
    #[error("edit revision must be greater than 0")]
    ZeroRevision,
    /// New or delete envelope with a non-zero revision
    #[error("{kind} envelope carries revision {revision}")]
    UnexpectedRevision {
        /// Envelope kind
        kind: EnvelopeKind,
        /// Revision found
        revision: u32,
    },
    /// Body payload is larger than allowed
    #[error("body is {size} bytes, limit is {max}")]
    BodyTooLarge {
        /// Body payload size
        size: usize,
        /// Limit
        max: usize,
    },
    /// Server GUID is longer than allowed
    #[error("server guid is {length} bytes, limit is {max}")]
    ServerGuidTooLong {
        /// GUID length
        length: usize,
        /// Limit
        max: usize,
    },
}

/// Decides whether an author may post in a conversation.
///
/// Membership lives outside the ingestion core; the host application plugs its
/// own check in here.
pub trait Authorizer: Send + Sync + fmt::Debug {
    /// Whether `author_id` may post in `conversation_id`
    fn is_authorized(&self, conversation_id: &ConversationId, author_id: &AuthorId) -> bool;
}

/// Authorizer that accepts every author
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _conversation_id: &ConversationId, _author_id: &AuthorId) -> bool {
        true
    }
}

/// What a validated envelope does to its message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Append the message
    New {
        /// Original body
        body: Body,
    },
    /// Replace the body
    Edit {
        /// Edit revision, at least 1
        revision: u32,
        /// Replacement body
        body: Body,
    },
    /// Tombstone the message
    Delete,
}

impl Mutation {
    /// Envelope kind this mutation came from
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::New { .. } => EnvelopeKind::New,
            Self::Edit { .. } => EnvelopeKind::Edit,
            Self::Delete => EnvelopeKind::Delete,
        }
    }
}

/// Validate an envelope against `config` at local time `now` and return the
/// mutation it asks for.
pub fn validate_envelope(
    envelope: &Envelope,
    now: u64,
    config: &CourierConfig,
    authorizer: &dyn Authorizer,
) -> Result<Mutation, ValidationError> {
    validate_key(envelope)?;
    validate_timestamp(envelope.source_timestamp, now, config)?;
    let mutation = validate_shape(envelope)?;
    validate_sizes(envelope, config)?;

    if !authorizer.is_authorized(&envelope.conversation_id, &envelope.author_id) {
        return Err(ValidationError::Unauthorized {
            conversation_id: envelope.conversation_id.clone(),
            author_id: envelope.author_id.clone(),
        });
    }

    Ok(mutation)
}

fn validate_key(envelope: &Envelope) -> Result<(), ValidationError> {
    if envelope.conversation_id.is_empty() {
        return Err(ValidationError::EmptyConversationId);
    }
    if envelope.author_id.is_empty() {
        return Err(ValidationError::EmptyAuthorId);
    }
    if envelope.source_timestamp == 0 {
        return Err(ValidationError::ZeroTimestamp);
    }
    Ok(())
}

fn validate_timestamp(timestamp: u64, now: u64, config: &CourierConfig) -> Result<(), ValidationError> {
    if timestamp > now.saturating_add(config.max_future_skew_ms) {
        return Err(ValidationError::TimestampInFuture {
            timestamp,
            now,
            max_skew_ms: config.max_future_skew_ms,
        });
    }

    if timestamp < now.saturating_sub(config.max_envelope_age_ms) {
        return Err(ValidationError::TimestampTooOld {
            timestamp,
            now,
            max_age_ms: config.max_envelope_age_ms,
        });
    }

    Ok(())
}

fn validate_shape(envelope: &Envelope) -> Result<Mutation, ValidationError> {
    let kind = envelope.kind;
    match kind {
        EnvelopeKind::New => {
            let body = envelope
                .body
                .clone()
                .ok_or(ValidationError::MissingBody { kind })?;
            match envelope.revision {
                None | Some(0) => Ok(Mutation::New { body }),
                Some(revision) => Err(ValidationError::UnexpectedRevision { kind, revision }),
            }
        }
        EnvelopeKind::Edit => {
            let body = envelope
                .body
                .clone()
                .ok_or(ValidationError::MissingBody { kind })?;
            match envelope.revision {
                None => Err(ValidationError::MissingRevision),
                Some(0) => Err(ValidationError::ZeroRevision),
                Some(revision) => Ok(Mutation::Edit { revision, body }),
            }
        }
        EnvelopeKind::Delete => {
            if envelope.body.is_some() {
                return Err(ValidationError::UnexpectedBody);
            }
            match envelope.revision {
                None => Ok(Mutation::Delete),
                Some(revision) => Err(ValidationError::UnexpectedRevision { kind, revision }),
            }
        }
    }
}

fn validate_sizes(envelope: &Envelope, config: &CourierConfig) -> Result<(), ValidationError> {
    if let Some(body) = &envelope.body {
        let size = body.payload_len();
        if size > config.max_body_bytes {
            return Err(ValidationError::BodyTooLarge {
                size,
                max: config.max_body_bytes,
            });
        }
    }

    if let Some(guid) = &envelope.server_guid
        && guid.len() > config.max_server_guid_length
    {
        return Err(ValidationError::ServerGuidTooLong {
            length: guid.len(),
            max: config.max_server_guid_length,
        });
    }

    Ok(())
}
