//! Range-set invariants under random insertion, checked against a naive
//! interval model.

use keel_core::kv::Database;
use keel_core::rangeset::RangeSet;
use keel_core::subspace::Subspace;
use keel_core::KvError;
use keel_storage_memory::MemoryDatabase;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn fixture() -> (Database, RangeSet) {
    let db = MemoryDatabase::new();
    (Database::new(db), RangeSet::new(Subspace::new(vec![0x7F])))
}

async fn insert(db: &Database, set: &RangeSet, lo: Vec<u8>, hi: Vec<u8>) {
    let set = set.clone();
    db.with_txn(move |txn| {
        let set = set.clone();
        let (lo, hi) = (lo.clone(), hi.clone());
        Box::pin(async move { set.insert(txn, &lo, &hi).await })
    })
    .await
    .unwrap()
}

async fn stored(db: &Database, set: &RangeSet) -> Vec<(Vec<u8>, Vec<u8>)> {
    let set = set.clone();
    db.with_txn(move |txn| {
        let set = set.clone();
        Box::pin(async move { set.ranges(txn).await })
    })
    .await
    .unwrap()
}

async fn gap(db: &Database, set: &RangeSet, after: Vec<u8>, end: Vec<u8>) -> Option<(Vec<u8>, Vec<u8>)> {
    let set = set.clone();
    db.with_txn(move |txn| {
        let set = set.clone();
        let (after, end) = (after.clone(), end.clone());
        Box::pin(async move { set.next_incomplete(txn, &after, &end).await })
    })
    .await
    .unwrap()
}

/// Points covered by a list of byte intervals, over a small 1-byte domain.
fn model_coverage(intervals: &[(u8, u8)]) -> Vec<bool> {
    let mut covered = vec![false; 256];
    for (lo, hi) in intervals {
        for p in *lo..*hi {
            covered[p as usize] = true;
        }
    }
    covered
}

#[tokio::test]
async fn merge_overlapping_and_adjacent() {
    let (db, set) = fixture();
    insert(&db, &set, vec![10], vec![20]).await;
    insert(&db, &set, vec![30], vec![40]).await;
    assert_eq!(stored(&db, &set).await.len(), 2);

    // Adjacent on the left neighbor's end: merges
    insert(&db, &set, vec![20], vec![25]).await;
    assert_eq!(stored(&db, &set).await, vec![(vec![10], vec![25]), (vec![30], vec![40])]);

    // Bridges the remaining gap: everything collapses to one interval
    insert(&db, &set, vec![24], vec![30]).await;
    assert_eq!(stored(&db, &set).await, vec![(vec![10], vec![40])]);

    // Covered insert is a no-op
    insert(&db, &set, vec![12], vec![38]).await;
    assert_eq!(stored(&db, &set).await, vec![(vec![10], vec![40])]);
}

#[tokio::test]
async fn random_inserts_maintain_invariants() {
    let (db, set) = fixture();
    let mut rng = StdRng::seed_from_u64(42);
    let mut model: Vec<(u8, u8)> = Vec::new();

    for _ in 0..200 {
        let a: u8 = rng.gen_range(0..250);
        let b: u8 = rng.gen_range(a + 1..=250);
        model.push((a, b));
        insert(&db, &set, vec![a], vec![b]).await;

        let intervals = stored(&db, &set).await;
        // Disjoint and non-adjacent, in order
        for pair in intervals.windows(2) {
            assert!(pair[0].1 < pair[1].0, "intervals must be disjoint and non-adjacent: {:?}", intervals);
        }
        for (lo, hi) in &intervals {
            assert!(lo < hi);
        }
        // Union equals the union of all inserts
        let expect = model_coverage(&model);
        let got = model_coverage(&intervals.iter().map(|(lo, hi)| (lo[0], hi[0])).collect::<Vec<_>>());
        assert_eq!(expect, got);
    }
}

#[tokio::test]
async fn next_incomplete_walks_gaps() {
    let (db, set) = fixture();
    insert(&db, &set, vec![10], vec![20]).await;
    insert(&db, &set, vec![30], vec![40]).await;

    // Gap before the first interval
    assert_eq!(gap(&db, &set, vec![0], vec![50]).await, Some((vec![0], vec![10])));
    // A cursor inside a completed interval resumes at its end
    assert_eq!(gap(&db, &set, vec![15], vec![50]).await, Some((vec![20], vec![30])));
    // Gap after the last interval, clipped to the total end
    assert_eq!(gap(&db, &set, vec![35], vec![50]).await, Some((vec![40], vec![50])));
    // Fully covered prefix
    insert(&db, &set, vec![0], vec![50]).await;
    assert_eq!(gap(&db, &set, vec![0], vec![50]).await, None);
}

#[tokio::test]
async fn clear_removes_everything() {
    let (db, set) = fixture();
    insert(&db, &set, vec![1], vec![2]).await;
    insert(&db, &set, vec![5], vec![9]).await;

    let set2 = set.clone();
    db.with_txn(move |txn| {
        let set = set2.clone();
        Box::pin(async move { set.clear(txn).await })
    })
    .await
    .unwrap();
    assert!(stored(&db, &set).await.is_empty());
    assert_eq!(gap(&db, &set, vec![0], vec![10]).await, Some((vec![0], vec![10])));
}

#[tokio::test]
async fn progress_is_monotonic() -> Result<(), KvError> {
    let (db, set) = fixture();
    let mut last = 0.0f64;
    for step in 0..10u8 {
        let lo = vec![step * 20];
        let hi = vec![step * 20 + 10];
        insert(&db, &set, lo, hi).await;
        let set2 = set.clone();
        let fraction = db
            .with_txn(move |txn| {
                let set = set2.clone();
                Box::pin(async move { set.progress(txn, &[0u8], &[200u8]).await })
            })
            .await?;
        assert!((0.0..=1.0).contains(&fraction));
        assert!(fraction >= last);
        last = fraction;
    }
    Ok(())
}
