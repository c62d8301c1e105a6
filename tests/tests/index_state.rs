//! Index lifecycle state machine.

use keel_core::error::{IndexError, StoreError};
use keel_core::index::IndexState;
use keel_core::store::RecordStore;
use keel_tests::{mark_readable, open_store, user_schema};

async fn enable(store: &RecordStore, index: &str) -> Result<(), StoreError> { store.enable_index(index).await }

#[tokio::test]
async fn allowed_transitions_succeed_and_are_visible() {
    let (_db, store) = open_store(user_schema());

    assert_eq!(store.index_state("users_by_age").await.unwrap(), IndexState::Disabled);

    enable(&store, "users_by_age").await.unwrap();
    assert_eq!(store.index_state("users_by_age").await.unwrap(), IndexState::WriteOnly);

    mark_readable(&store, "users_by_age").await.unwrap();
    assert_eq!(store.index_state("users_by_age").await.unwrap(), IndexState::Readable);

    store.disable_index("users_by_age").await.unwrap();
    assert_eq!(store.index_state("users_by_age").await.unwrap(), IndexState::Disabled);
}

#[tokio::test]
async fn fresh_reader_observes_persisted_state() {
    use keel_core::kv::Database;
    use keel_core::record::FieldwiseCodec;
    use keel_core::subspace::Subspace;
    use std::sync::Arc;

    let (db, store) = open_store(user_schema());
    enable(&store, "users_by_age").await.unwrap();
    mark_readable(&store, "users_by_age").await.unwrap();

    // A second store over the same database sees the committed state byte
    let fresh = RecordStore::new(Database::new(db), Subspace::new(vec![0x01]), Arc::new(user_schema()), Arc::new(FieldwiseCodec))
        .unwrap();
    assert_eq!(fresh.index_state("users_by_age").await.unwrap(), IndexState::Readable);
}

#[tokio::test]
async fn invalid_transitions_fail() {
    let (_db, store) = open_store(user_schema());

    // disabled -> readable is not allowed
    let err = mark_readable(&store, "users_by_age").await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Index(IndexError::InvalidStateTransition { from: IndexState::Disabled, to: IndexState::Readable, .. })
    ));

    // enable twice: write-only -> write-only is not in the table
    enable(&store, "users_by_age").await.unwrap();
    let err = enable(&store, "users_by_age").await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Index(IndexError::InvalidStateTransition { from: IndexState::WriteOnly, to: IndexState::WriteOnly, .. })
    ));

    // readable -> write-only is not allowed either
    mark_readable(&store, "users_by_age").await.unwrap();
    let err = enable(&store, "users_by_age").await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Index(IndexError::InvalidStateTransition { from: IndexState::Readable, to: IndexState::WriteOnly, .. })
    ));

    // disable is allowed from any state, including disabled
    store.disable_index("users_by_age").await.unwrap();
    store.disable_index("users_by_age").await.unwrap();
}

#[tokio::test]
async fn write_only_index_is_maintained_but_not_queried() {
    use keel_core::query::Predicate;
    use keel_core::record::Record;

    let (_db, store) = open_store(user_schema());
    enable(&store, "users_by_age").await.unwrap();

    store.save(&Record::new("User").with("id", 1i64).with("email", "a@x").with("age", 30i64)).await.unwrap();
    assert_eq!(keel_tests::dump_index(&store, "users_by_age").await.len(), 1, "write-only index receives entries");

    // The planner must not use a write-only index
    let explanation = store.query("User").filter(Predicate::field("age").eq(30i64)).explain().await.unwrap();
    assert_eq!(explanation.description, "scan");
}
