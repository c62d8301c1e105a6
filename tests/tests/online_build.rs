//! Building an index over pre-existing records.

use keel_core::index::IndexState;
use keel_core::indexer::{IndexerPolicy, IndexerThrottle, OnlineIndexer};
use keel_core::query::Predicate;
use keel_core::record::Record;
use keel_core::value::Value;
use keel_tests::{open_store, user_schema};

fn user(k: i64) -> Record {
    Record::new("User").with("id", k).with("name", format!("user{}", k)).with("email", format!("user{}@x", k)).with("age", 20i64 + (k % 50))
}

#[tokio::test]
async fn build_makes_existing_records_queryable() {
    let (_db, store) = open_store(user_schema());

    // Populate with the email index still disabled
    for k in 0..20 {
        store.save(&user(k)).await.unwrap();
    }
    assert!(keel_tests::dump_index(&store, "users_by_email").await.is_empty());

    let indexer = OnlineIndexer::new(store.clone(), "users_by_email", IndexerPolicy::default()).unwrap();
    indexer.build().await.unwrap();

    assert_eq!(store.index_state("users_by_email").await.unwrap(), IndexState::Readable);
    assert_eq!(keel_tests::dump_index(&store, "users_by_email").await.len(), 20);

    let progress = indexer.progress();
    assert_eq!(progress.scanned, 20);
    assert_eq!(progress.indexed, 20);
    assert!((progress.fraction - 1.0).abs() < 1e-9);

    for k in [0i64, 7, 19] {
        let found = store.query("User").filter(Predicate::field("email").eq(format!("user{}@x", k))).execute().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field("id"), Some(&Value::Int(k)));
    }
}

#[tokio::test]
async fn small_batches_commit_incrementally() {
    let (_db, store) = open_store(user_schema());
    for k in 0..100 {
        store.save(&user(k)).await.unwrap();
    }

    let policy = IndexerPolicy {
        throttle: IndexerThrottle {
            max_records_per_txn: 7,
            adaptive_batch: false,
            delay_between_txn: std::time::Duration::from_millis(0),
            ..IndexerThrottle::default()
        },
        ..IndexerPolicy::default()
    };
    let indexer = OnlineIndexer::new(store.clone(), "users_by_email", policy).unwrap();
    indexer.build().await.unwrap();

    assert_eq!(keel_tests::dump_index(&store, "users_by_email").await.len(), 100);
    assert_eq!(store.index_state("users_by_email").await.unwrap(), IndexState::Readable);
}

#[tokio::test]
async fn writers_during_build_are_not_lost() {
    let (_db, store) = open_store(user_schema());
    for k in 0..50 {
        store.save(&user(k)).await.unwrap();
    }

    // Enable write-only first, then write more records while "building":
    // the write-only index picks them up, the scan covers the backlog
    store.enable_index("users_by_email").await.unwrap();
    for k in 50..60 {
        store.save(&user(k)).await.unwrap();
    }

    let policy = IndexerPolicy { enable_write_only: false, ..IndexerPolicy::default() };
    let indexer = OnlineIndexer::new(store.clone(), "users_by_email", policy).unwrap();
    indexer.build().await.unwrap();

    assert_eq!(keel_tests::dump_index(&store, "users_by_email").await.len(), 60);
}
