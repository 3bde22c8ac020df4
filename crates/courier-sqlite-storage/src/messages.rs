//! Implementation of MessageStorage trait for SQLite storage.

use courier_storage_traits::messages::MessageStorage;
use courier_storage_traits::messages::edit_chain::{EditChain, EditEntry};
use courier_storage_traits::messages::error::MessageError;
use courier_storage_traits::messages::types::*;
use courier_storage_traits::{Backend, ConversationId};
use rusqlite::{Connection, OptionalExtension, params};

use crate::db::{self, RECORD_COLUMNS};
use crate::validation::{
    MAX_BODY_JSON_SIZE, MAX_SERVER_GUID_LENGTH, validate_size, validate_string_length,
};
use crate::CourierSqliteStorage;

#[inline]
fn into_message_err<T>(e: T) -> MessageError
where
    T: std::error::Error,
{
    MessageError::DatabaseError(e.to_string())
}

fn serialize_body(body: &Body) -> Result<String, MessageError> {
    let body_json = serde_json::to_string(body)
        .map_err(|e| MessageError::Serialization(format!("Failed to serialize body: {}", e)))?;
    validate_size(body_json.as_bytes(), MAX_BODY_JSON_SIZE, "Body JSON")
        .map_err(|e| MessageError::InvalidParameters(e.to_string()))?;
    Ok(body_json)
}

fn select_record(conn: &Connection, key: &MessageKey) -> Result<Option<MessageRecord>, MessageError> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {RECORD_COLUMNS} FROM messages
             WHERE conversation_id = ? AND author_id = ? AND source_timestamp = ?"
        ))
        .map_err(into_message_err)?;

    stmt.query_row(
        params![
            key.conversation_id.as_slice(),
            key.author_id.as_slice(),
            key.source_timestamp
        ],
        db::row_to_record,
    )
    .optional()
    .map_err(into_message_err)
}

fn insert_edit_entry(
    conn: &Connection,
    record_id: RecordId,
    entry: &EditEntry,
    body_json: &str,
) -> Result<(), MessageError> {
    conn.execute(
        "INSERT INTO edit_chain (record_id, revision, body, applied_at) VALUES (?, ?, ?, ?)",
        params![record_id.as_u64(), entry.revision, body_json, entry.applied_at],
    )
    .map_err(into_message_err)?;
    Ok(())
}

impl MessageStorage for CourierSqliteStorage {
    fn backend(&self) -> Backend {
        Backend::SQLite
    }

    fn append_message(&self, mut record: NewMessageRecord) -> Result<AppendResult, MessageError> {
        if let Some(guid) = &record.server_guid {
            validate_string_length(guid, MAX_SERVER_GUID_LENGTH, "Server GUID")
                .map_err(|e| MessageError::InvalidParameters(e.to_string()))?;
        }

        let body_json = serialize_body(&record.body)?;
        let flags_json = serde_json::to_string(&record.delivery_flags).map_err(|e| {
            MessageError::Serialization(format!("Failed to serialize delivery flags: {}", e))
        })?;

        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction().map_err(into_message_err)?;

            if let Some(existing) = select_record(&tx, &record.key)? {
                return Ok(AppendResult::AlreadyExists(existing));
            }

            // Never slot in before the tail of the conversation log
            let tail: Option<u64> = tx
                .query_row(
                    "SELECT MAX(received_at) FROM messages WHERE conversation_id = ?",
                    params![record.key.conversation_id.as_slice()],
                    |row| row.get(0),
                )
                .map_err(into_message_err)?;
            if let Some(tail) = tail {
                record.received_at = record.received_at.max(tail.saturating_add(1));
            }

            tx.execute(
                "INSERT INTO messages
                 (conversation_id, author_id, source_timestamp, received_at, server_timestamp,
                  server_delivery_timestamp, server_guid, revision, body_kind, body,
                  delivery_flags, expires_in_secs, is_deleted)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, 0)",
                params![
                    record.key.conversation_id.as_slice(),
                    record.key.author_id.as_slice(),
                    record.key.source_timestamp,
                    record.received_at,
                    record.server_timestamp,
                    record.server_delivery_timestamp,
                    record.server_guid,
                    record.body.kind_str(),
                    &body_json,
                    &flags_json,
                    record.expires_in_secs,
                ],
            )
            .map_err(into_message_err)?;

            let raw_id = u64::try_from(tx.last_insert_rowid()).map_err(|_| {
                MessageError::DatabaseError("SQLite returned a negative record id".to_string())
            })?;
            let record_id = RecordId::new(raw_id);

            let original = EditEntry {
                revision: 0,
                body: record.body.clone(),
                applied_at: record.received_at,
            };
            insert_edit_entry(&tx, record_id, &original, &body_json)?;

            tx.commit().map_err(into_message_err)?;

            let stored = MessageRecord::from_new(record_id, record);
            tracing::debug!(
                target: "courier_sqlite_storage::messages",
                "Appended record {} for {}",
                stored.record_id,
                stored.key
            );
            Ok(AppendResult::Appended(stored))
        })
    }

    fn find_message(&self, key: &MessageKey) -> Result<Option<MessageRecord>, MessageError> {
        self.with_connection(|conn| select_record(conn, key))
    }

    fn apply_revision(
        &self,
        key: &MessageKey,
        entry: EditEntry,
    ) -> Result<RevisionResult, MessageError> {
        let body_json = serialize_body(&entry.body)?;

        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction().map_err(into_message_err)?;

            let Some(mut record) = select_record(&tx, key)? else {
                return Ok(RevisionResult::NotFound);
            };

            if record.is_deleted {
                return Ok(RevisionResult::Tombstoned);
            }

            if entry.revision <= record.revision {
                return Ok(RevisionResult::Stale {
                    current: record.revision,
                });
            }

            tx.execute(
                "UPDATE messages SET revision = ?, body_kind = ?, body = ? WHERE record_id = ?",
                params![
                    entry.revision,
                    entry.body.kind_str(),
                    &body_json,
                    record.record_id.as_u64()
                ],
            )
            .map_err(into_message_err)?;
            insert_edit_entry(&tx, record.record_id, &entry, &body_json)?;

            tx.commit().map_err(into_message_err)?;

            record.revision = entry.revision;
            record.body = entry.body;

            tracing::debug!(
                target: "courier_sqlite_storage::messages",
                "Applied revision {} to {}",
                record.revision,
                key
            );
            Ok(RevisionResult::Applied(record))
        })
    }

    fn mark_deleted(&self, key: &MessageKey) -> Result<DeleteResult, MessageError> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction().map_err(into_message_err)?;

            let Some(mut record) = select_record(&tx, key)? else {
                return Ok(DeleteResult::NotFound);
            };

            if record.is_deleted {
                return Ok(DeleteResult::AlreadyDeleted(record));
            }

            tx.execute(
                "UPDATE messages SET is_deleted = 1 WHERE record_id = ?",
                params![record.record_id.as_u64()],
            )
            .map_err(into_message_err)?;
            tx.commit().map_err(into_message_err)?;

            record.is_deleted = true;
            tracing::debug!(target: "courier_sqlite_storage::messages", "Tombstoned {}", key);
            Ok(DeleteResult::Applied(record))
        })
    }

    fn find_edit_chain(&self, key: &MessageKey) -> Result<Option<EditChain>, MessageError> {
        self.with_connection(|conn| {
            let Some(record) = select_record(conn, key)? else {
                return Ok(None);
            };

            let mut stmt = conn
                .prepare_cached(
                    "SELECT revision, body, applied_at FROM edit_chain
                     WHERE record_id = ? ORDER BY revision ASC",
                )
                .map_err(into_message_err)?;

            let entries = stmt
                .query_map(params![record.record_id.as_u64()], db::row_to_edit_entry)
                .map_err(into_message_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(into_message_err)?;

            Ok(Some(EditChain::from_entries(entries)))
        })
    }

    fn messages_after(
        &self,
        conversation_id: &ConversationId,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MessageError> {
        // SQLite takes a signed limit; anything past i64::MAX is "no limit"
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.with_connection(|conn| {
            let records = match cursor.position() {
                Some(after) => {
                    let mut stmt = conn
                        .prepare_cached(&format!(
                            "SELECT {RECORD_COLUMNS} FROM messages
                             WHERE conversation_id = ?
                               AND (received_at, source_timestamp, record_id) > (?, ?, ?)
                             ORDER BY received_at ASC, source_timestamp ASC, record_id ASC
                             LIMIT ?"
                        ))
                        .map_err(into_message_err)?;
                    stmt.query_map(
                        params![
                            conversation_id.as_slice(),
                            after.received_at,
                            after.source_timestamp,
                            after.record_id.as_u64(),
                            limit
                        ],
                        db::row_to_record,
                    )
                    .map_err(into_message_err)?
                    .collect::<Result<Vec<_>, _>>()
                }
                None => {
                    let mut stmt = conn
                        .prepare_cached(&format!(
                            "SELECT {RECORD_COLUMNS} FROM messages
                             WHERE conversation_id = ?
                             ORDER BY received_at ASC, source_timestamp ASC, record_id ASC
                             LIMIT ?"
                        ))
                        .map_err(into_message_err)?;
                    stmt.query_map(
                        params![conversation_id.as_slice(), limit],
                        db::row_to_record,
                    )
                    .map_err(into_message_err)?
                    .collect::<Result<Vec<_>, _>>()
                }
            };

            records.map_err(into_message_err)
        })
    }

    fn conversations(&self) -> Result<Vec<ConversationId>, MessageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT conversation_id FROM messages")
                .map_err(into_message_err)?;

            stmt.query_map([], |row| {
                Ok(ConversationId::from_slice(row.get_ref(0)?.as_blob()?))
            })
            .map_err(into_message_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(into_message_err)
        })
    }

    fn latest_received_at(&self) -> Result<Option<u64>, MessageError> {
        self.with_connection(|conn| {
            conn.query_row("SELECT MAX(received_at) FROM messages", [], |row| {
                row.get::<_, Option<u64>>(0)
            })
            .map_err(into_message_err)
        })
    }
}
