//! Database utilities for SQLite storage.

use std::collections::BTreeSet;
use std::io::{Error as IoError, ErrorKind};

use courier_storage_traits::messages::edit_chain::EditEntry;
use courier_storage_traits::messages::types::{
    Body, DeliveryFlag, MessageKey, MessageRecord, RecordId,
};
use courier_storage_traits::{AuthorId, ConversationId};
use rusqlite::types::Type;
use rusqlite::{Error, Result as SqliteResult, Row};

/// Columns selected for a full [`MessageRecord`]
pub const RECORD_COLUMNS: &str = "record_id, conversation_id, author_id, source_timestamp, \
     received_at, server_timestamp, server_delivery_timestamp, server_guid, revision, body, \
     delivery_flags, expires_in_secs, is_deleted";

#[inline]
fn map_to_text_boxed_error<T>(e: T) -> Error
where
    T: std::error::Error + Send + Sync + 'static,
{
    Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
}

#[inline]
fn map_invalid_integer_data(msg: &str) -> Error {
    Error::FromSqlConversionFailure(
        0,
        Type::Integer,
        Box::new(IoError::new(ErrorKind::InvalidData, msg)),
    )
}

/// Convert a row to a [`MessageRecord`]
pub fn row_to_record(row: &Row) -> SqliteResult<MessageRecord> {
    let record_id: i64 = row.get("record_id")?;
    let conversation_id = ConversationId::from_slice(row.get_ref("conversation_id")?.as_blob()?);
    let author_id = AuthorId::from_slice(row.get_ref("author_id")?.as_blob()?);
    let source_timestamp: u64 = row.get("source_timestamp")?;
    let received_at: u64 = row.get("received_at")?;
    let server_timestamp: u64 = row.get("server_timestamp")?;
    let server_delivery_timestamp: u64 = row.get("server_delivery_timestamp")?;
    let server_guid: Option<String> = row.get("server_guid")?;
    let revision: u32 = row.get("revision")?;
    let body_json: &str = row.get_ref("body")?.as_str()?;
    let flags_json: &str = row.get_ref("delivery_flags")?.as_str()?;
    let expires_in_secs: u32 = row.get("expires_in_secs")?;
    let is_deleted: bool = row.get("is_deleted")?;

    let record_id = u64::try_from(record_id)
        .map_err(|_| map_invalid_integer_data("Negative record id"))?;
    let body: Body = serde_json::from_str(body_json).map_err(map_to_text_boxed_error)?;
    let delivery_flags: BTreeSet<DeliveryFlag> =
        serde_json::from_str(flags_json).map_err(map_to_text_boxed_error)?;

    Ok(MessageRecord {
        record_id: RecordId::new(record_id),
        key: MessageKey::new(conversation_id, author_id, source_timestamp),
        received_at,
        server_timestamp,
        server_delivery_timestamp,
        server_guid,
        revision,
        body,
        delivery_flags,
        expires_in_secs,
        is_deleted,
    })
}

/// Convert an `edit_chain` row to an [`EditEntry`]
pub fn row_to_edit_entry(row: &Row) -> SqliteResult<EditEntry> {
    let revision: u32 = row.get("revision")?;
    let body_json: &str = row.get_ref("body")?.as_str()?;
    let applied_at: u64 = row.get("applied_at")?;

    let body: Body = serde_json::from_str(body_json).map_err(map_to_text_boxed_error)?;

    Ok(EditEntry {
        revision,
        body,
        applied_at,
    })
}
