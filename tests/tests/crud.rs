//! Basic record lifecycle: insert, read, query, update, delete.

use keel_core::query::Predicate;
use keel_core::record::Record;
use keel_core::tuple::Tuple;
use keel_core::value::Value;
use keel_tests::{activate_indexes, open_store, user_schema};

fn user(id: i64, name: &str, email: &str, age: i64) -> Record {
    Record::new("User").with("id", id).with("name", name).with("email", email).with("age", age)
}

#[tokio::test]
async fn crud_round_trip() {
    let (_db, store) = open_store(user_schema());
    activate_indexes(&store, &["users_by_email", "users_by_age", "user_count"]).await;

    store.save(&user(1, "Alice", "a@x", 30)).await.unwrap();
    store.save(&user(2, "Bob", "b@x", 25)).await.unwrap();
    store.save(&user(3, "Cha", "c@x", 35)).await.unwrap();

    // Read by primary key
    let alice = store.get(&Tuple::single(1i64)).await.unwrap().expect("alice exists");
    assert_eq!(alice.field("name"), Some(&Value::String("Alice".into())));

    // Point query through the email index
    let bobs = store.query("User").filter(Predicate::field("email").eq("b@x")).execute().await.unwrap();
    assert_eq!(bobs.len(), 1);
    assert_eq!(bobs[0].field("id"), Some(&Value::Int(2)));

    // Range query through the age index
    let adults = store.query("User").filter(Predicate::field("age").ge(30i64)).execute().await.unwrap();
    let mut ids: Vec<i64> = adults.iter().filter_map(|r| r.field("id").and_then(|v| v.as_i64())).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 3]);

    // Update: save with the same primary key replaces, index entries follow
    store.save(&user(2, "Bob", "b@x", 26)).await.unwrap();
    let bob = store.get(&Tuple::single(2i64)).await.unwrap().expect("bob exists");
    assert_eq!(bob.field("age"), Some(&Value::Int(26)));
    let at_25 = store.query("User").filter(Predicate::field("age").eq(25i64)).execute().await.unwrap();
    assert!(at_25.is_empty());
    let at_26 = store.query("User").filter(Predicate::field("age").eq(26i64)).execute().await.unwrap();
    assert_eq!(at_26.len(), 1);

    // Delete and verify the count aggregate
    assert!(store.delete(&Tuple::single(3i64)).await.unwrap());
    assert!(store.get(&Tuple::single(3i64)).await.unwrap().is_none());
    assert!(matches!(store.get_required(&Tuple::single(3i64)).await, Err(keel_core::StoreError::RecordNotFound(_))));
    assert!(!store.delete(&Tuple::single(3i64)).await.unwrap(), "second delete is a no-op");
    let count = store.aggregate("user_count", &Tuple::single("users")).await.unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn idempotent_save_leaves_state_unchanged() {
    let (_db, store) = open_store(user_schema());
    activate_indexes(&store, &["users_by_email", "users_by_age", "user_count"]).await;

    let record = user(7, "Eve", "e@x", 41);
    store.save(&record).await.unwrap();
    store.save(&record).await.unwrap();

    let count = store.aggregate("user_count", &Tuple::single("users")).await.unwrap();
    assert_eq!(count, 1, "count is bumped once per record, not per save");
}

#[tokio::test]
async fn disabled_index_is_silently_skipped() {
    let (_db, store) = open_store(user_schema());
    // Only the age index participates; email index stays disabled
    activate_indexes(&store, &["users_by_age"]).await;

    store.save(&user(1, "Alice", "a@x", 30)).await.unwrap();

    let entries = keel_tests::dump_index(&store, "users_by_email").await;
    assert!(entries.is_empty(), "disabled index must receive no writes");
    let by_age = keel_tests::dump_index(&store, "users_by_age").await;
    assert_eq!(by_age.len(), 1);
}
