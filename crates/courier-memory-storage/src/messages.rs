//! Memory-based storage implementation of the MessageStorage trait

use std::ops::Bound;

use courier_storage_traits::messages::MessageStorage;
use courier_storage_traits::messages::edit_chain::{EditChain, EditEntry};
use courier_storage_traits::messages::error::MessageError;
use courier_storage_traits::messages::types::*;
use courier_storage_traits::{Backend, ConversationId};

use crate::CourierMemoryStorage;

impl CourierMemoryStorage {
    fn validate_body(&self, body: &Body) -> Result<(), MessageError> {
        let len = body.payload_len();
        if len > self.limits.max_body_bytes {
            return Err(MessageError::InvalidParameters(format!(
                "Body exceeds maximum size of {} bytes (got {} bytes)",
                self.limits.max_body_bytes, len
            )));
        }
        Ok(())
    }

    fn validate_new_record(&self, record: &NewMessageRecord) -> Result<(), MessageError> {
        self.validate_body(&record.body)?;
        if let Some(guid) = &record.server_guid
            && guid.len() > self.limits.max_server_guid_length
        {
            return Err(MessageError::InvalidParameters(format!(
                "Server GUID exceeds maximum length of {} bytes (got {} bytes)",
                self.limits.max_server_guid_length,
                guid.len()
            )));
        }
        Ok(())
    }
}

impl MessageStorage for CourierMemoryStorage {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn append_message(&self, mut record: NewMessageRecord) -> Result<AppendResult, MessageError> {
        self.validate_new_record(&record)?;

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if let Some(existing) = inner.records.get(&record.key) {
            return Ok(AppendResult::AlreadyExists(existing.clone()));
        }

        // Never slot in before the tail of the conversation log
        if let Some((tail, _)) = inner
            .logs
            .get(&record.key.conversation_id)
            .and_then(|log| log.last_key_value())
        {
            record.received_at = record.received_at.max(tail.received_at.saturating_add(1));
        }

        let record_id = RecordId::new(inner.next_record_id);
        inner.next_record_id += 1;

        let applied_at = record.received_at;
        let stored = MessageRecord::from_new(record_id, record);

        inner
            .logs
            .entry(stored.key.conversation_id.clone())
            .or_default()
            .insert(stored.position(), stored.key.clone());
        inner.edit_chains.insert(
            stored.key.clone(),
            EditChain::new(stored.body.clone(), applied_at),
        );
        inner.records.insert(stored.key.clone(), stored.clone());

        tracing::debug!(
            target: "courier_memory_storage::messages",
            "Appended record {} for {}",
            stored.record_id,
            stored.key
        );

        Ok(AppendResult::Appended(stored))
    }

    fn find_message(&self, key: &MessageKey) -> Result<Option<MessageRecord>, MessageError> {
        let inner = self.inner.read();
        Ok(inner.records.get(key).cloned())
    }

    fn apply_revision(
        &self,
        key: &MessageKey,
        entry: EditEntry,
    ) -> Result<RevisionResult, MessageError> {
        self.validate_body(&entry.body)?;

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let Some(record) = inner.records.get_mut(key) else {
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

        record.revision = entry.revision;
        record.body = entry.body.clone();
        let updated = record.clone();

        inner.edit_chains.entry(key.clone()).or_default().push(entry);

        tracing::debug!(
            target: "courier_memory_storage::messages",
            "Applied revision {} to {}",
            updated.revision,
            key
        );

        Ok(RevisionResult::Applied(updated))
    }

    fn mark_deleted(&self, key: &MessageKey) -> Result<DeleteResult, MessageError> {
        let mut inner = self.inner.write();

        let Some(record) = inner.records.get_mut(key) else {
            return Ok(DeleteResult::NotFound);
        };

        if record.is_deleted {
            return Ok(DeleteResult::AlreadyDeleted(record.clone()));
        }

        record.is_deleted = true;
        tracing::debug!(target: "courier_memory_storage::messages", "Tombstoned {}", key);
        Ok(DeleteResult::Applied(record.clone()))
    }

    fn find_edit_chain(&self, key: &MessageKey) -> Result<Option<EditChain>, MessageError> {
        let inner = self.inner.read();
        Ok(inner.edit_chains.get(key).cloned())
    }

    fn messages_after(
        &self,
        conversation_id: &ConversationId,
        cursor: &Cursor,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MessageError> {
        let inner = self.inner.read();

        let Some(log) = inner.logs.get(conversation_id) else {
            return Ok(Vec::new());
        };

        let lower = match cursor.position() {
            Some(after) => Bound::Excluded(after),
            None => Bound::Unbounded,
        };

        let records = log
            .range((lower, Bound::Unbounded))
            .take(limit)
            .filter_map(|(_, key)| inner.records.get(key).cloned())
            .collect();

        Ok(records)
    }

    fn conversations(&self) -> Result<Vec<ConversationId>, MessageError> {
        let inner = self.inner.read();
        Ok(inner.logs.keys().cloned().collect())
    }

    fn latest_received_at(&self) -> Result<Option<u64>, MessageError> {
        let inner = self.inner.read();
        Ok(inner.records.values().map(|record| record.received_at).max())
    }
}
