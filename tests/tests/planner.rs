//! Plan selection and plan/executor agreement.

use keel_core::error::StoreError;
use keel_core::keyexpr::KeyExpression;
use keel_core::query::{Predicate, RecordQuery};
use keel_core::record::Record;
use keel_core::schema::{IndexDef, RecordType, Schema};
use keel_core::stats::Statistics;
use keel_core::store::RecordStore;
use keel_core::value::ValueType;
use keel_tests::{activate_indexes, open_store};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CITIES: [&str; 8] = ["Tokyo", "Paris", "Lima", "Oslo", "Cairo", "Quito", "Perth", "Turin"];

fn schema(compound: bool) -> Schema {
    let mut builder = Schema::builder(1)
        .record_type(
            RecordType::new("Person", KeyExpression::field("id"))
                .field("id", ValueType::Int)
                .field("city", ValueType::String)
                .field("age", ValueType::Int),
        )
        .index(IndexDef::value("by_city", KeyExpression::field("city")))
        .index(IndexDef::value("by_age", KeyExpression::field("age")));
    if compound {
        builder = builder.index(IndexDef::value("by_city_age", KeyExpression::fields(["city", "age"])));
    }
    builder.build().unwrap()
}

async fn populate(store: &RecordStore, n: i64) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut all = Vec::new();
    for id in 0..n {
        let record = Record::new("Person")
            .with("id", id)
            .with("city", CITIES[rng.gen_range(0..CITIES.len())])
            .with("age", rng.gen_range(0i64..90));
        store.save(&record).await.unwrap();
        all.push(record);
    }
    all
}

async fn collect_stats(store: &RecordStore, indexes: &[&str]) {
    for index in indexes {
        let subspace = store.index_subspace(index).unwrap();
        let index_name = index.to_string();
        let store2 = store.clone();
        store
            .database()
            .with_txn(move |txn| {
                let subspace = subspace.clone();
                let index_name = index_name.clone();
                let store = store2.clone();
                Box::pin(async move {
                    let stats = Statistics::new(store.stats_subspace()?);
                    let mut rng = StdRng::seed_from_u64(11);
                    stats.collect_value(txn, &subspace, &index_name, 1.0, &mut rng).await?;
                    Ok::<_, StoreError>(())
                })
            })
            .await
            .unwrap();
    }
}

fn brute_force<'r>(records: &'r [Record], predicate: &Predicate) -> Vec<&'r Record> {
    records.iter().filter(|r| predicate.matches(r)).collect()
}

async fn assert_agrees(query: RecordQuery, records: &[Record], predicate: &Predicate) {
    let mut got: Vec<i64> = query.execute().await.unwrap().iter().filter_map(|r| r.field("id").and_then(|v| v.as_i64())).collect();
    got.sort();
    let mut expect: Vec<i64> = brute_force(records, predicate).iter().filter_map(|r| r.field("id").and_then(|v| v.as_i64())).collect();
    expect.sort();
    assert_eq!(got, expect);
}

#[tokio::test]
async fn conjunction_uses_compound_index_when_present() {
    let (_db, store) = open_store(schema(true));
    activate_indexes(&store, &["by_city", "by_age", "by_city_age"]).await;
    let records = populate(&store, 3000).await;
    collect_stats(&store, &["by_city", "by_age", "by_city_age"]).await;

    let predicate = Predicate::and([Predicate::field("city").eq("Tokyo"), Predicate::field("age").gt(18i64)]);
    let explanation = store.query("Person").filter(predicate.clone()).explain().await.unwrap();
    assert!(explanation.description.contains("by_city_age"), "got plan {}", explanation.description);

    // The chosen plan must beat the full scan on cost
    let scan_cost = explanation.alternatives.iter().find(|(d, _)| d == "scan").map(|(_, c)| *c).unwrap();
    assert!(explanation.cost < scan_cost);

    assert_agrees(store.query("Person").filter(predicate.clone()), &records, &predicate).await;
}

#[tokio::test]
async fn conjunction_without_compound_index_avoids_full_scan() {
    let (_db, store) = open_store(schema(false));
    activate_indexes(&store, &["by_city", "by_age"]).await;
    let records = populate(&store, 3000).await;
    collect_stats(&store, &["by_city", "by_age"]).await;

    let predicate = Predicate::and([Predicate::field("city").eq("Tokyo"), Predicate::field("age").eq(30i64)]);
    let explanation = store.query("Person").filter(predicate.clone()).explain().await.unwrap();
    assert_ne!(explanation.description, "scan", "selective conjunction must not scan");

    assert_agrees(store.query("Person").filter(predicate.clone()), &records, &predicate).await;
}

#[tokio::test]
async fn disjunction_unions_index_scans() {
    let (_db, store) = open_store(schema(false));
    activate_indexes(&store, &["by_city", "by_age"]).await;
    let records = populate(&store, 1000).await;

    let predicate = Predicate::or([Predicate::field("city").eq("Tokyo"), Predicate::field("city").eq("Paris")]);
    let explanation = store.query("Person").filter(predicate.clone()).explain().await.unwrap();
    assert!(explanation.description.starts_with("union"), "got plan {}", explanation.description);

    assert_agrees(store.query("Person").filter(predicate.clone()), &records, &predicate).await;
}

#[tokio::test]
async fn every_plan_shape_returns_exact_matches() {
    let (_db, store) = open_store(schema(true));
    activate_indexes(&store, &["by_city", "by_age", "by_city_age"]).await;
    let records = populate(&store, 1500).await;

    let predicates = vec![
        Predicate::True,
        Predicate::field("city").eq("Lima"),
        Predicate::field("age").lt(30i64),
        Predicate::and([Predicate::field("city").eq("Oslo"), Predicate::field("age").ge(40i64)]),
        Predicate::or([Predicate::field("city").eq("Perth"), Predicate::field("age").eq(77i64)]),
        Predicate::not(Predicate::field("city").eq("Cairo")),
        Predicate::and([
            Predicate::field("age").ge(10i64),
            Predicate::or([Predicate::field("city").eq("Lima"), Predicate::field("city").eq("Turin")]),
        ]),
        Predicate::field("city").starts_with("P"),
    ];
    for predicate in predicates {
        assert_agrees(store.query("Person").filter(predicate.clone()), &records, &predicate).await;
    }
}

#[tokio::test]
async fn limit_caps_results() {
    let (_db, store) = open_store(schema(false));
    activate_indexes(&store, &["by_city", "by_age"]).await;
    populate(&store, 500).await;

    let results = store.query("Person").filter(Predicate::field("age").ge(0i64)).limit(10).execute().await.unwrap();
    assert_eq!(results.len(), 10);
}
