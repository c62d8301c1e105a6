//! A failed save must leave no trace: record and index entries commit
//! together or not at all.

use keel_core::kv::{Database, RetryOptions};
use keel_core::record::{FieldwiseCodec, Record};
use keel_core::store::RecordStore;
use keel_core::subspace::Subspace;
use keel_core::tuple::Tuple;
use keel_storage_memory::MemoryDatabase;
use keel_tests::{activate_indexes, dump_index, user_schema};
use std::sync::Arc;

/// Store wired with a single-attempt retry policy, so injected commit
/// failures surface instead of being retried away.
fn no_retry_store() -> (Arc<MemoryDatabase>, RecordStore) {
    let db = MemoryDatabase::new();
    let database = Database::with_retry(db.clone(), RetryOptions { max_attempts: 1, ..RetryOptions::default() });
    let store =
        RecordStore::new(database, Subspace::new(vec![0x01]), Arc::new(user_schema()), Arc::new(FieldwiseCodec)).unwrap();
    (db, store)
}

fn user(id: i64) -> Record {
    Record::new("User").with("id", id).with("name", "N").with("email", format!("{}@x", id)).with("age", 30i64)
}

#[tokio::test]
async fn aborted_save_leaves_record_and_indexes_unchanged() {
    let (db, store) = no_retry_store();
    activate_indexes(&store, &["users_by_email", "users_by_age", "user_count"]).await;

    store.save(&user(1)).await.unwrap();
    let email_before = dump_index(&store, "users_by_email").await;
    let age_before = dump_index(&store, "users_by_age").await;
    let keys_before = db.key_count();

    db.inject_commit_failures(1);
    assert!(store.save(&user(2)).await.is_err());

    assert!(store.get(&Tuple::single(2i64)).await.unwrap().is_none());
    assert_eq!(dump_index(&store, "users_by_email").await, email_before);
    assert_eq!(dump_index(&store, "users_by_age").await, age_before);
    assert_eq!(db.key_count(), keys_before);
    assert_eq!(store.aggregate("user_count", &Tuple::single("users")).await.unwrap(), 1);
}

#[tokio::test]
async fn aborted_delete_leaves_everything_in_place() {
    let (db, store) = no_retry_store();
    activate_indexes(&store, &["users_by_email", "users_by_age", "user_count"]).await;

    store.save(&user(1)).await.unwrap();
    let before = db.key_count();

    db.inject_commit_failures(1);
    assert!(store.delete(&Tuple::single(1i64)).await.is_err());

    assert!(store.get(&Tuple::single(1i64)).await.unwrap().is_some());
    assert_eq!(db.key_count(), before);
    assert_eq!(dump_index(&store, "users_by_email").await.len(), 1);
}

#[tokio::test]
async fn retry_policy_rides_out_transient_conflicts() {
    // Default retry policy: the injected failure is retried transparently
    let db = MemoryDatabase::new();
    let database = Database::new(db.clone());
    let store =
        RecordStore::new(database, Subspace::new(vec![0x01]), Arc::new(user_schema()), Arc::new(FieldwiseCodec)).unwrap();
    activate_indexes(&store, &["users_by_email"]).await;

    db.inject_commit_failures(2);
    store.save(&user(5)).await.unwrap();
    assert!(store.get(&Tuple::single(5i64)).await.unwrap().is_some());
}
