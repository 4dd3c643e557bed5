//! Behavior shared by every `MessageStore` backend.
//!
//! Each check runs against `MemoryStore` and a temp-file `RedbStore`.

use chrono::{DateTime, TimeDelta, Utc};
use parley_proto::{Message, MessageKind, MessageStatus, Reactions};
use parley_sync::{Cursor, MemoryStore, MessageStore, RedbStore, StorageError};
use proptest::prelude::*;
use tempfile::TempDir;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn message(id: &str, secs: i64) -> Message {
    Message {
        id: id.into(),
        conversation_id: "c1".into(),
        sender_id: "bob".into(),
        original_content: "hola".into(),
        original_language: None,
        translated_content: None,
        target_language: None,
        kind: MessageKind::Text,
        status: MessageStatus::Sent,
        created_at: at(secs),
        reactions: Reactions::new(),
        attachment: None,
        reply_to: None,
        deleted_at: None,
        deleted_by: None,
    }
}

fn redb(capacity: usize) -> (RedbStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = RedbStore::open_with_capacity(dir.path().join("cache.redb"), capacity).unwrap();
    (store, dir)
}

fn check_cache_bound<S: MessageStore>(store: &S) {
    // Inserted out of order: the evicted row is the oldest by createdAt,
    // not the first inserted.
    for i in (0..101).rev() {
        store.upsert_message(&message(&format!("m{i:03}"), i)).unwrap();
    }

    assert_eq!(store.message_count("c1").unwrap(), 100);
    let loaded = store.load_messages("c1", None, 200).unwrap();
    assert_eq!(loaded.len(), 100);
    assert_eq!(loaded[0].id, "m001");
    assert_eq!(loaded[99].id, "m100");
    assert!(loaded.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

fn check_upsert_moves_edited_message<S: MessageStore>(store: &S) {
    store.upsert_message(&message("a", 1)).unwrap();
    store.upsert_message(&message("b", 2)).unwrap();
    store.upsert_message(&message("a", 3)).unwrap();

    let ids: Vec<_> = store.load_messages("c1", None, 10).unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, ["b", "a"]);
    assert_eq!(store.message_count("c1").unwrap(), 2);
}

fn check_remove<S: MessageStore>(store: &S) {
    store.upsert_message(&message("a", 1)).unwrap();
    assert!(store.remove_message("c1", "a").unwrap());
    assert!(!store.remove_message("c1", "a").unwrap());
    assert_eq!(store.message_count("c1").unwrap(), 0);
}

fn check_same_microsecond_orders_by_id<S: MessageStore>(store: &S) {
    // Nanoseconds apart, inserted newest first
    let mut later = message("a", 1);
    later.created_at += TimeDelta::nanoseconds(900);
    let mut earlier = message("b", 1);
    earlier.created_at += TimeDelta::nanoseconds(100);
    store.upsert_message(&later).unwrap();
    store.upsert_message(&earlier).unwrap();

    let ids: Vec<_> = store.load_messages("c1", None, 10).unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, ["a", "b"]);

    let after_a = store.load_messages("c1", Some(&Cursor::of(&later)), 10).unwrap();
    assert_eq!(after_a.len(), 1);
    assert_eq!(after_a[0].id, "b");
    let before_b = store.load_older("c1", &Cursor::of(&earlier), 10).unwrap();
    assert_eq!(before_b.len(), 1);
    assert_eq!(before_b[0].id, "a");

    // Evicts "a", the first in that order
    store.upsert_message(&message("c", 2)).unwrap();
    let ids: Vec<_> = store.load_messages("c1", None, 10).unwrap().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, ["b", "c"]);
}

#[test]
fn memory_cache_bound() {
    check_cache_bound(&MemoryStore::new());
}

#[test]
fn redb_cache_bound() {
    let (store, _dir) = redb(100);
    check_cache_bound(&store);
}

#[test]
fn memory_upsert_moves_edited_message() {
    check_upsert_moves_edited_message(&MemoryStore::new());
}

#[test]
fn redb_upsert_moves_edited_message() {
    let (store, _dir) = redb(100);
    check_upsert_moves_edited_message(&store);
}

#[test]
fn memory_remove() {
    check_remove(&MemoryStore::new());
}

#[test]
fn redb_remove() {
    let (store, _dir) = redb(100);
    check_remove(&store);
}

#[test]
fn memory_same_microsecond_orders_by_id() {
    check_same_microsecond_orders_by_id(&MemoryStore::with_capacity(2));
}

#[test]
fn redb_same_microsecond_orders_by_id() {
    let (store, _dir) = redb(2);
    check_same_microsecond_orders_by_id(&store);
}

#[test]
fn redb_rejects_oversized_conversation_id() {
    let (store, _dir) = redb(100);
    let mut oversized = message("m1", 1);
    oversized.conversation_id = "c".repeat(usize::from(u16::MAX) + 1);

    let err = store.upsert_message(&oversized).unwrap_err();
    assert!(matches!(err, StorageError::KeyTooLong { .. }));
    assert!(matches!(
        store.load_messages(&oversized.conversation_id, None, 10),
        Err(StorageError::KeyTooLong { .. })
    ));
}

proptest! {
    /// Upserting any sequence (with repeats) leaves one row per id, at most
    /// `capacity` rows in `(createdAt, id)` order, each holding the last
    /// write for its id.
    #[test]
    fn prop_upsert_is_idempotent_and_bounded(
        writes in prop::collection::vec((0u8..40, 0i64..1_000), 1..120),
        capacity in 1usize..30,
    ) {
        let store = MemoryStore::with_capacity(capacity);
        let mut expected = std::collections::BTreeMap::new();
        for (id, secs) in &writes {
            let id = format!("m{id}");
            store.upsert_message(&message(&id, *secs)).unwrap();
            expected.insert(id, at(*secs));
        }

        let loaded = store.load_messages("c1", None, usize::MAX).unwrap();
        prop_assert!(loaded.len() <= capacity);

        let ids: std::collections::BTreeSet<_> = loaded.iter().map(|m| m.id.clone()).collect();
        prop_assert_eq!(ids.len(), loaded.len());
        prop_assert!(loaded.windows(2).all(|w| (w[0].created_at, &w[0].id) < (w[1].created_at, &w[1].id)));

        for m in &loaded {
            prop_assert_eq!(expected.get(&m.id), Some(&m.created_at));
        }
    }
}
