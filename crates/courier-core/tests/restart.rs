//! Crash and restart: the dedup index is rebuilt from storage alone

use std::sync::Arc;

use courier_core::dedup_index::RebuildStats;
use courier_core::prelude::*;
use courier_memory_storage::{CourierMemoryStorage, ValidationLimits};
use courier_sqlite_storage::CourierSqliteStorage;
use courier_storage_traits::test_utils::{conversation, key};
use tempfile::tempdir;

mod common;

use self::common::*;

/// Mixed traffic across three conversations: plain messages, edits, deletes
/// and a deferred edit that never finds its message.
fn traffic() -> Vec<Envelope> {
    vec![
        new_text("conv1", "alice", 100, "hi"),
        new_text("conv1", "bob", 110, "hey"),
        edit_text("conv1", "alice", 100, 1, "hi!"),
        new_text("conv2", "carol", 120, "yo"),
        delete("conv2", "carol", 120),
        new_text("conv3", "dave", 130, "sup"),
        edit_text("conv3", "dave", 130, 2, "sup?"),
        edit_text("conv3", "dave", 130, 1, "sup!"),
        edit_text("conv1", "erin", 999, 1, "orphan"),
    ]
}

fn ingest_all<S>(pipeline: &IngestionPipeline<S>)
where
    S: MessageStorage,
{
    for result in pipeline.ingest_batch(traffic()) {
        result.unwrap();
    }
}

fn expected_stats() -> RebuildStats {
    RebuildStats {
        conversations: 3,
        records: 4,
        tombstones: 1,
    }
}

fn assert_state_survived<S>(pipeline: &IngestionPipeline<S>)
where
    S: MessageStorage,
{
    // Re-delivered traffic is fully absorbed
    for outcome in pipeline.ingest_batch(traffic()) {
        let outcome = outcome.unwrap();
        assert!(
            !outcome.is_applied(),
            "{} re-applied after restart: {:?}",
            outcome.key(),
            outcome
        );
    }

    let deleted = pipeline
        .store()
        .get(&key("conv2", "carol", 120))
        .unwrap()
        .unwrap();
    assert!(deleted.is_deleted);

    let edited = pipeline
        .store()
        .get(&key("conv3", "dave", 130))
        .unwrap()
        .unwrap();
    assert_eq!(edited.revision, 2);
    assert_eq!(edited.body, Body::text("sup?"));
}

#[test]
fn test_memory_restart_rebuilds_identical_index() {
    let storage = Arc::new(CourierMemoryStorage::default());
    let before = pipeline(Arc::clone(&storage));
    ingest_all(&before);
    let index_before = before.index().snapshot();
    assert_eq!(index_before.len(), 4);

    // Crash: only what storage holds survives
    let snapshot = storage.create_snapshot();
    drop(before);
    drop(storage);

    let restored = CourierMemoryStorage::from_snapshot(snapshot, ValidationLimits::default());
    let after = pipeline(restored);

    assert_eq!(after.rebuild_stats(), expected_stats());
    assert_eq!(after.index().snapshot(), index_before);
    assert_eq!(after.deferred_keys(), 0);
    assert_state_survived(&after);
}

#[test]
fn test_sqlite_restart_rebuilds_identical_index() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("courier.db");

    let index_before = {
        let before = pipeline(CourierSqliteStorage::new(&db_path).unwrap());
        ingest_all(&before);
        before.index().snapshot()
    };
    assert_eq!(index_before.len(), 4);

    let after = pipeline(CourierSqliteStorage::new(&db_path).unwrap());
    assert_eq!(after.rebuild_stats(), expected_stats());
    assert_eq!(after.index().snapshot(), index_before);
    assert_state_survived(&after);
}

#[test]
fn test_restart_resumes_stream_from_saved_cursor() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("courier.db");

    let cursor = {
        let before = pipeline(CourierSqliteStorage::new(&db_path).unwrap());
        // One at a time, so the log order of conv1 is known
        for envelope in traffic() {
            before.ingest(envelope).unwrap();
        }
        let mut stream = before
            .store()
            .stream_since(&conversation("conv1"), Cursor::start());
        stream.next().unwrap().unwrap();
        stream.cursor()
    };

    let after = pipeline(CourierSqliteStorage::new(&db_path).unwrap());
    after.ingest(new_text("conv1", "frank", 140, "late")).unwrap();

    let rest: Vec<MessageKey> = after
        .store()
        .stream_since(&conversation("conv1"), cursor)
        .map(|r| r.unwrap().key)
        .collect();
    assert_eq!(
        rest,
        vec![key("conv1", "bob", 110), key("conv1", "frank", 140)]
    );
}
