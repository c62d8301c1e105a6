//! Interrupting and resuming an online build yields the same index as an
//! uninterrupted one.

use keel_core::index::IndexState;
use keel_core::indexer::{IndexerPolicy, IndexerThrottle, OnlineIndexer};
use keel_core::record::Record;
use keel_tests::{dump_index, open_store, user_schema};

const POPULATION: i64 = 10_000;

fn user(k: i64) -> Record {
    Record::new("User").with("id", k).with("name", format!("u{}", k)).with("email", format!("u{}@x", k)).with("age", 18i64 + (k % 60))
}

fn tiny_batches() -> IndexerPolicy {
    IndexerPolicy {
        throttle: IndexerThrottle {
            max_records_per_txn: 50,
            adaptive_batch: false,
            delay_between_txn: std::time::Duration::from_millis(1),
            ..IndexerThrottle::default()
        },
        ..IndexerPolicy::default()
    }
}

#[tokio::test]
async fn interrupted_build_resumes_to_identical_contents() {
    let (_db, store) = open_store(user_schema());
    for k in 0..POPULATION {
        store.save(&user(k)).await.unwrap();
    }

    // Reference: an uninterrupted build on a second, identical store
    let (_db2, reference) = open_store(user_schema());
    for k in 0..POPULATION {
        reference.save(&user(k)).await.unwrap();
    }
    let uninterrupted = OnlineIndexer::new(reference.clone(), "users_by_email", tiny_batches()).unwrap();
    uninterrupted.build().await.unwrap();

    // Interrupted run: stop cooperatively after some batches committed
    let indexer = OnlineIndexer::new(store.clone(), "users_by_email", tiny_batches()).unwrap();
    let stop = indexer.stop_handle();
    let handle = {
        let indexer = std::sync::Arc::new(indexer);
        let background = indexer.clone();
        let task = tokio::spawn(async move { background.build().await });
        // Let a few batches land, then pull the plug
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if indexer.progress().scanned >= 200 {
                stop.store(true, std::sync::atomic::Ordering::SeqCst);
                break;
            }
        }
        task.await.unwrap().unwrap();
        indexer
    };

    // Mid-flight: progress recorded, index partial, still write-only
    let partial = dump_index(&store, "users_by_email").await.len();
    assert!(partial > 0, "some batches committed before the stop");
    assert!(partial < POPULATION as usize, "the stop landed before completion");
    assert_eq!(store.index_state("users_by_email").await.unwrap(), IndexState::WriteOnly);
    let progress = handle.progress();
    assert!(progress.fraction < 1.0);

    // Resume from the recorded ranges
    handle.resume().await.unwrap();
    assert_eq!(store.index_state("users_by_email").await.unwrap(), IndexState::Readable);

    let resumed = dump_index(&store, "users_by_email").await;
    let baseline = dump_index(&reference, "users_by_email").await;
    assert_eq!(resumed, baseline, "resumed build must equal the uninterrupted one");
}

#[tokio::test]
async fn resume_requires_write_only_state() {
    let (_db, store) = open_store(user_schema());
    let indexer = OnlineIndexer::new(store.clone(), "users_by_email", tiny_batches()).unwrap();
    // Never started: the index is still disabled
    assert!(indexer.resume().await.is_err());
}
