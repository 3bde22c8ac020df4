//! Message storage test functions

use std::collections::BTreeSet;

use courier_storage_traits::ConversationId;
use courier_storage_traits::messages::MessageStorage;
use courier_storage_traits::messages::edit_chain::EditEntry;
use courier_storage_traits::messages::types::{
    AppendResult, Body, BodyRange, Cursor, DeleteResult, DeliveryFlag, PaymentNotification,
    RangeStyle, RevisionResult,
};

use super::{create_test_key, create_test_record};

fn edit(revision: u32, text: &str, applied_at: u64) -> EditEntry {
    EditEntry {
        revision,
        body: Body::text(text),
        applied_at,
    }
}

/// Test append then find
pub fn test_append_and_find<S>(storage: S)
where
    S: MessageStorage,
{
    let key = create_test_key(b"conv1", b"alice", 100);
    let result = storage
        .append_message(create_test_record(key.clone(), "hi", 1_000))
        .unwrap();

    let appended = match result {
        AppendResult::Appended(record) => record,
        other => panic!("Expected Appended, got {:?}", other),
    };
    assert_eq!(appended.revision, 0);
    assert!(!appended.is_deleted);

    let found = storage.find_message(&key).unwrap().unwrap();
    assert_eq!(found, appended);
    assert_eq!(found.body, Body::text("hi"));
    assert_eq!(found.server_timestamp, 101);
    assert_eq!(found.server_guid.as_deref(), Some("guid-1"));

    let missing = create_test_key(b"conv1", b"alice", 101);
    assert!(storage.find_message(&missing).unwrap().is_none());
}

/// Appending an existing key must not write anything
pub fn test_append_existing_key<S>(storage: S)
where
    S: MessageStorage,
{
    let key = create_test_key(b"conv1", b"alice", 100);
    let first = match storage
        .append_message(create_test_record(key.clone(), "hi", 1_000))
        .unwrap()
    {
        AppendResult::Appended(record) => record,
        other => panic!("Expected Appended, got {:?}", other),
    };

    let second = storage
        .append_message(create_test_record(key.clone(), "different", 2_000))
        .unwrap();
    assert_eq!(second, AppendResult::AlreadyExists(first.clone()));

    let stored = storage.find_message(&key).unwrap().unwrap();
    assert_eq!(stored.body, Body::text("hi"));
    assert_eq!(stored.received_at, 1_000);

    let all = storage
        .messages_after(&key.conversation_id, &Cursor::start(), 10)
        .unwrap();
    assert_eq!(all.len(), 1);
}

/// Revision application follows strict revision ordering
pub fn test_apply_revision<S>(storage: S)
where
    S: MessageStorage,
{
    let key = create_test_key(b"conv1", b"alice", 100);
    storage
        .append_message(create_test_record(key.clone(), "hi", 1_000))
        .unwrap();

    match storage.apply_revision(&key, edit(3, "three", 1_001)).unwrap() {
        RevisionResult::Applied(record) => {
            assert_eq!(record.revision, 3);
            assert_eq!(record.body, Body::text("three"));
        }
        other => panic!("Expected Applied, got {:?}", other),
    }

    assert_eq!(
        storage.apply_revision(&key, edit(1, "one", 1_002)).unwrap(),
        RevisionResult::Stale { current: 3 }
    );
    assert_eq!(
        storage.apply_revision(&key, edit(3, "three again", 1_003)).unwrap(),
        RevisionResult::Stale { current: 3 }
    );

    let stored = storage.find_message(&key).unwrap().unwrap();
    assert_eq!(stored.revision, 3);
    assert_eq!(stored.body, Body::text("three"));
    // Log position is untouched by edits
    assert_eq!(stored.received_at, 1_000);

    let unknown = create_test_key(b"conv1", b"bob", 100);
    assert_eq!(
        storage.apply_revision(&unknown, edit(1, "x", 1_004)).unwrap(),
        RevisionResult::NotFound
    );
}

/// Deletes leave tombstones that refuse further revisions
pub fn test_mark_deleted<S>(storage: S)
where
    S: MessageStorage,
{
    let key = create_test_key(b"conv1", b"alice", 100);
    storage
        .append_message(create_test_record(key.clone(), "hi", 1_000))
        .unwrap();
    storage.apply_revision(&key, edit(1, "hi!", 1_001)).unwrap();

    let deleted = match storage.mark_deleted(&key).unwrap() {
        DeleteResult::Applied(record) => record,
        other => panic!("Expected Applied, got {:?}", other),
    };
    assert!(deleted.is_deleted);
    assert_eq!(deleted.revision, 1);

    match storage.mark_deleted(&key).unwrap() {
        DeleteResult::AlreadyDeleted(record) => assert!(record.is_deleted),
        other => panic!("Expected AlreadyDeleted, got {:?}", other),
    }

    assert_eq!(
        storage.apply_revision(&key, edit(2, "back", 1_002)).unwrap(),
        RevisionResult::Tombstoned
    );

    // The tombstone keeps deduplicating
    match storage
        .append_message(create_test_record(key.clone(), "hi", 1_003))
        .unwrap()
    {
        AppendResult::AlreadyExists(record) => assert!(record.is_deleted),
        other => panic!("Expected AlreadyExists, got {:?}", other),
    }

    let unknown = create_test_key(b"conv1", b"bob", 100);
    assert_eq!(storage.mark_deleted(&unknown).unwrap(), DeleteResult::NotFound);
}

/// Edit chains keep every accepted revision
pub fn test_edit_chain<S>(storage: S)
where
    S: MessageStorage,
{
    let key = create_test_key(b"conv1", b"alice", 100);
    assert!(storage.find_edit_chain(&key).unwrap().is_none());

    storage
        .append_message(create_test_record(key.clone(), "v0", 1_000))
        .unwrap();
    storage.apply_revision(&key, edit(1, "v1", 1_001)).unwrap();
    storage.apply_revision(&key, edit(1, "stale", 1_002)).unwrap();
    storage.apply_revision(&key, edit(4, "v4", 1_003)).unwrap();

    let chain = storage.find_edit_chain(&key).unwrap().unwrap();
    let revisions: Vec<u32> = chain.entries().iter().map(|e| e.revision).collect();
    assert_eq!(revisions, vec![0, 1, 4]);
    assert_eq!(chain.entries()[0].body, Body::text("v0"));
    assert_eq!(chain.entries()[0].applied_at, 1_000);
    assert_eq!(chain.latest().unwrap().body, Body::text("v4"));
    assert!(chain.is_edited());
}

/// Paging through a conversation log in order
pub fn test_messages_after<S>(storage: S)
where
    S: MessageStorage,
{
    let conversation = ConversationId::from_slice(b"conv1");
    // Received out of source order; the log follows received_at
    let arrivals = [(300u64, 1_000u64), (100, 1_001), (200, 1_002), (50, 1_003)];
    for (ts, received_at) in arrivals {
        let key = create_test_key(b"conv1", b"alice", ts);
        storage
            .append_message(create_test_record(key, &format!("m{ts}"), received_at))
            .unwrap();
    }
    // Another conversation must not leak in
    storage
        .append_message(create_test_record(
            create_test_key(b"conv2", b"alice", 1),
            "other",
            999,
        ))
        .unwrap();

    let first_page = storage
        .messages_after(&conversation, &Cursor::start(), 3)
        .unwrap();
    let ts: Vec<u64> = first_page.iter().map(|r| r.key.source_timestamp).collect();
    assert_eq!(ts, vec![300, 100, 200]);

    let cursor = Cursor::after(first_page.last().unwrap());
    let second_page = storage.messages_after(&conversation, &cursor, 3).unwrap();
    let ts: Vec<u64> = second_page.iter().map(|r| r.key.source_timestamp).collect();
    assert_eq!(ts, vec![50]);

    let cursor = Cursor::after(second_page.last().unwrap());
    assert!(storage.messages_after(&conversation, &cursor, 3).unwrap().is_empty());

    let missing = ConversationId::from_slice(b"nope");
    assert!(
        storage
            .messages_after(&missing, &Cursor::start(), 3)
            .unwrap()
            .is_empty()
    );
}

/// Conversation listing and clock seed
pub fn test_conversations_and_latest_received_at<S>(storage: S)
where
    S: MessageStorage,
{
    assert!(storage.conversations().unwrap().is_empty());
    assert_eq!(storage.latest_received_at().unwrap(), None);

    storage
        .append_message(create_test_record(
            create_test_key(b"conv2", b"alice", 1),
            "a",
            5_000,
        ))
        .unwrap();
    storage
        .append_message(create_test_record(
            create_test_key(b"conv1", b"bob", 1),
            "b",
            6_000,
        ))
        .unwrap();
    storage
        .append_message(create_test_record(
            create_test_key(b"conv1", b"bob", 2),
            "c",
            7_000,
        ))
        .unwrap();

    let mut conversations = storage.conversations().unwrap();
    conversations.sort();
    assert_eq!(
        conversations,
        vec![
            ConversationId::from_slice(b"conv1"),
            ConversationId::from_slice(b"conv2"),
        ]
    );
    assert_eq!(storage.latest_received_at().unwrap(), Some(7_000));
}

/// A late receive stamp never places a record before the conversation tail
pub fn test_append_is_append_only<S>(storage: S)
where
    S: MessageStorage,
{
    let conversation = ConversationId::from_slice(b"conv1");
    storage
        .append_message(create_test_record(
            create_test_key(b"conv1", b"alice", 10),
            "first",
            5_000,
        ))
        .unwrap();
    let page = storage
        .messages_after(&conversation, &Cursor::start(), 10)
        .unwrap();
    let cursor = Cursor::after(page.last().unwrap());

    let late = match storage
        .append_message(create_test_record(
            create_test_key(b"conv1", b"bob", 1),
            "late",
            4_000,
        ))
        .unwrap()
    {
        AppendResult::Appended(record) => record,
        other => panic!("Expected Appended, got {:?}", other),
    };
    assert_eq!(late.received_at, 5_001);

    // A reader that already passed the tail still sees the new record
    let next = storage.messages_after(&conversation, &cursor, 10).unwrap();
    assert_eq!(next, vec![late.clone()]);
    assert_eq!(storage.find_message(&late.key).unwrap().unwrap(), late);
}

/// Every body variant and flag survives storage
pub fn test_rich_record_fields<S>(storage: S)
where
    S: MessageStorage,
{
    let key = create_test_key(b"conv1", b"alice", 100);
    let mut record = create_test_record(key.clone(), "unused", 1_000);
    record.body = Body::Text {
        text: "hey @bob".to_string(),
        ranges: vec![BodyRange {
            start: 4,
            length: 4,
            style: RangeStyle::Mention(courier_storage_traits::AuthorId::from_slice(b"bob")),
        }],
    };
    record.delivery_flags = BTreeSet::from([DeliveryFlag::SealedSender, DeliveryFlag::ViewOnce]);
    record.expires_in_secs = 3_600;
    storage.append_message(record.clone()).unwrap();

    let payment = Body::Payment(PaymentNotification {
        note: Some("lunch".to_string()),
        receipt: vec![9, 8, 7],
    });
    storage
        .apply_revision(
            &key,
            EditEntry {
                revision: 1,
                body: payment.clone(),
                applied_at: 1_001,
            },
        )
        .unwrap();

    let stored = storage.find_message(&key).unwrap().unwrap();
    assert_eq!(stored.body, payment);
    assert_eq!(stored.delivery_flags, record.delivery_flags);
    assert_eq!(stored.expires_in_secs, 3_600);
    assert_eq!(stored.server_delivery_timestamp, 102);

    let chain = storage.find_edit_chain(&key).unwrap().unwrap();
    assert_eq!(chain.entries()[0].body, record.body);
}
