//! Interval-overlap queries over a boundary-pair index.

use keel_core::keyexpr::KeyExpression;
use keel_core::query::Predicate;
use keel_core::record::Record;
use keel_core::schema::{IndexDef, RecordType, Schema};
use keel_core::value::{Value, ValueType};
use keel_tests::{activate_indexes, open_store};

fn schema() -> Schema {
    Schema::builder(1)
        .record_type(
            RecordType::new("Event", KeyExpression::field("id"))
                .field("id", ValueType::Int)
                .field("availability", ValueType::Tuple),
        )
        .index(IndexDef::value("by_availability", KeyExpression::interval("availability")))
        .build()
        .unwrap()
}

fn event(id: i64, lo: i64, hi: i64) -> Record {
    Record::new("Event").with("id", id).with("availability", Value::Tuple(vec![Value::Int(lo), Value::Int(hi)]))
}

async fn ids(records: Vec<Record>) -> Vec<i64> {
    let mut out: Vec<i64> = records.iter().filter_map(|r| r.field("id").and_then(|v| v.as_i64())).collect();
    out.sort();
    out
}

#[tokio::test]
async fn point_probe_matches_half_open_intervals() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["by_availability"]).await;

    store.save(&event(1, 0, 100)).await.unwrap(); // covers now
    store.save(&event(2, 100, 200)).await.unwrap(); // starts exactly at now
    store.save(&event(3, 40, 100)).await.unwrap(); // ends exactly at now (excluded)
    store.save(&event(4, 150, 300)).await.unwrap(); // future

    let now = Value::Int(100);
    let matched = store
        .query("Event")
        .filter(Predicate::overlaps("availability", Some(now.clone()), Some(now)))
        .execute()
        .await
        .unwrap();
    assert_eq!(ids(matched).await, vec![1, 2], "lo <= now < hi");
}

#[tokio::test]
async fn open_ended_window_matches_everything_still_running() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["by_availability"]).await;

    store.save(&event(1, 0, 50)).await.unwrap(); // already over
    store.save(&event(2, 0, 150)).await.unwrap(); // still running
    store.save(&event(3, 200, 400)).await.unwrap(); // future

    let matched = store
        .query("Event")
        .filter(Predicate::overlaps("availability", Some(Value::Int(100)), None))
        .execute()
        .await
        .unwrap();
    assert_eq!(ids(matched).await, vec![2, 3], "hi > now");
}

#[tokio::test]
async fn bounded_window_overlap() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["by_availability"]).await;

    store.save(&event(1, 0, 10)).await.unwrap();
    store.save(&event(2, 5, 25)).await.unwrap();
    store.save(&event(3, 20, 30)).await.unwrap();
    store.save(&event(4, 30, 40)).await.unwrap();

    let matched = store
        .query("Event")
        .filter(Predicate::overlaps("availability", Some(Value::Int(8)), Some(Value::Int(22))))
        .execute()
        .await
        .unwrap();
    assert_eq!(ids(matched).await, vec![1, 2, 3]);
}
