//! Statistics collection over live indexes.

use keel_core::error::StoreError;
use keel_core::keyexpr::KeyExpression;
use keel_core::record::Record;
use keel_core::schema::{IndexDef, RecordType, Schema};
use keel_core::stats::Statistics;
use keel_core::value::{Value, ValueType};
use keel_tests::{activate_indexes, open_store};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn schema() -> Schema {
    Schema::builder(1)
        .record_type(
            RecordType::new("Event", KeyExpression::field("id"))
                .field("id", ValueType::Int)
                .field("kind", ValueType::Int)
                .field("window", ValueType::Tuple),
        )
        .index(IndexDef::value("by_kind", KeyExpression::field("kind")))
        .index(IndexDef::value("by_window", KeyExpression::interval("window")))
        .build()
        .unwrap()
}

#[tokio::test]
async fn value_statistics_describe_the_population() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["by_kind", "by_window"]).await;

    for id in 0..400i64 {
        store
            .save(
                &Record::new("Event")
                    .with("id", id)
                    .with("kind", id % 10)
                    .with("window", Value::Tuple(vec![Value::Int(id), Value::Int(id + 20)])),
            )
            .await
            .unwrap();
    }

    let subspace = store.index_subspace("by_kind").unwrap();
    let stats = {
        let subspace = subspace.clone();
        let store2 = store.clone();
        store
            .database()
            .with_txn(move |txn| {
                let subspace = subspace.clone();
                let store = store2.clone();
                Box::pin(async move {
                    let statistics = Statistics::new(store.stats_subspace()?);
                    let mut rng = StdRng::seed_from_u64(5);
                    Ok::<_, StoreError>(statistics.collect_value(txn, &subspace, "by_kind", 1.0, &mut rng).await?)
                })
            })
            .await
            .unwrap()
    };

    assert_eq!(stats.total, 400);
    assert_eq!(stats.cardinality, 10);
    assert!(!stats.histogram.is_empty());
    // Every bucket lies within the value domain; estimates stay in [0, 1]
    for kind in 0..10i64 {
        let s = stats.selectivity_eq(&Value::Int(kind));
        assert!(s > 0.0 && s <= 1.0);
    }
    assert_eq!(stats.selectivity_eq(&Value::Int(999)), 0.0);

    // A later collection overwrites the snapshot
    let reloaded = {
        let store2 = store.clone();
        store
            .database()
            .with_txn(move |txn| {
                let store = store2.clone();
                Box::pin(async move {
                    let statistics = Statistics::new(store.stats_subspace()?);
                    Ok::<_, StoreError>(statistics.load_value(txn, "by_kind").await?)
                })
            })
            .await
            .unwrap()
    };
    assert_eq!(reloaded.map(|s| s.total), Some(400));
}

#[tokio::test]
async fn interval_statistics_measure_widths_and_overlap() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["by_window"]).await;

    for id in 0..300i64 {
        store
            .save(
                &Record::new("Event")
                    .with("id", id)
                    .with("kind", 0i64)
                    .with("window", Value::Tuple(vec![Value::Int(id * 2), Value::Int(id * 2 + 10)])),
            )
            .await
            .unwrap();
    }

    let subspace = store.index_subspace("by_window").unwrap();
    let stats = {
        let subspace = subspace.clone();
        let store2 = store.clone();
        store
            .database()
            .with_txn(move |txn| {
                let subspace = subspace.clone();
                let store = store2.clone();
                Box::pin(async move {
                    let statistics = Statistics::new(store.stats_subspace()?);
                    let mut rng = StdRng::seed_from_u64(5);
                    Ok::<_, StoreError>(statistics.collect_interval(txn, &subspace, "by_window", 1.0, &mut rng).await?)
                })
            })
            .await
            .unwrap()
    };

    assert_eq!(stats.total, 300);
    assert!((stats.avg_width - 10.0).abs() < 1e-6);
    assert!(stats.base_selectivity > 0.0 && stats.base_selectivity <= 1.0);
    for width in [0.0, 5.0, 50.0, 1e9] {
        let s = stats.selectivity_overlap(width);
        assert!((0.0..=1.0).contains(&s), "width {} gave {}", width, s);
    }
}
