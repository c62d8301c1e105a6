//! Vector search: HNSW build, querying, and the flat-scan fallback.

use keel_core::error::{IndexError, QueryError, StoreError};
use keel_core::index::vector::distance;
use keel_core::indexer::{IndexerPolicy, OnlineIndexer};
use keel_core::keyexpr::KeyExpression;
use keel_core::record::Record;
use keel_core::schema::{DistanceMetric, IndexDef, RecordType, Schema, VectorOptions};
use keel_core::store::RecordStore;
use keel_core::value::ValueType;
use keel_tests::open_store;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIMS: usize = 384;
const POPULATION: usize = 200;
const K: usize = 5;

fn schema() -> Schema {
    let mut options = VectorOptions::new(DIMS, DistanceMetric::Cosine);
    // Wide search beam keeps recall exact at this population size
    options.ef_search = 256;
    options.ef_construction = 128;
    Schema::builder(1)
        .record_type(
            RecordType::new("Doc", KeyExpression::field("id")).field("id", ValueType::Int).field("embedding", ValueType::Vector),
        )
        .index(IndexDef::vector("doc_embeddings", KeyExpression::field("embedding"), options).for_types(["Doc"]))
        .build()
        .unwrap()
}

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    (0..DIMS).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

async fn populate(store: &RecordStore) -> Vec<(i64, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(99);
    let mut all = Vec::new();
    for id in 0..POPULATION as i64 {
        let v = random_vector(&mut rng);
        store.save(&Record::new("Doc").with("id", id).with("embedding", v.clone())).await.unwrap();
        all.push((id, v));
    }
    all
}

fn brute_force_top_k(data: &[(i64, Vec<f32>)], target: &[f32], k: usize) -> Vec<(i64, f64)> {
    let mut scored: Vec<(i64, f64)> = data.iter().map(|(id, v)| (*id, distance(DistanceMetric::Cosine, target, v))).collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1));
    scored.truncate(k);
    scored
}

fn result_ids(records: &[Record]) -> Vec<i64> {
    records.iter().filter_map(|r| r.field("id").and_then(|v| v.as_i64())).collect()
}

#[tokio::test]
async fn knn_lifecycle() {
    let (_db, store) = open_store(schema());

    // Write-only from the start so saves maintain the flat store
    store.enable_index("doc_embeddings").await.unwrap();
    let data = populate(&store).await;
    let mut rng = StdRng::seed_from_u64(123);
    let target = random_vector(&mut rng);

    // Querying before the graph exists fails fast with a specific error
    let err = store.query("Doc").nearest("doc_embeddings", target.clone(), K).execute().await.unwrap_err();
    assert!(matches!(err, QueryError::Index(IndexError::HnswNotBuilt { .. }) | QueryError::Store(StoreError::Index(IndexError::HnswNotBuilt { .. }))));

    // Build flat backlog (idempotent here) plus the graph, flip readable
    let policy = IndexerPolicy { enable_write_only: false, ..IndexerPolicy::default() };
    let indexer = OnlineIndexer::new(store.clone(), "doc_embeddings", policy).unwrap();
    indexer.build().await.unwrap();

    let results = store.query("Doc").nearest("doc_embeddings", target.clone(), K).execute().await.unwrap();
    let expected = brute_force_top_k(&data, &target, K);
    assert_eq!(result_ids(&results), expected.iter().map(|(id, _)| *id).collect::<Vec<_>>());

    // Administrative disable: graph queries refuse, the flat fallback agrees
    store.disable_index("doc_embeddings").await.unwrap();
    let err = store.query("Doc").nearest("doc_embeddings", target.clone(), K).execute().await.unwrap_err();
    assert!(matches!(
        err,
        QueryError::Index(IndexError::NotReadable { .. }) | QueryError::Store(StoreError::Index(IndexError::NotReadable { .. }))
    ));

    let fallback = store
        .query("Doc")
        .nearest("doc_embeddings", target.clone(), K)
        .allow_flat_fallback()
        .execute()
        .await
        .unwrap();
    assert_eq!(result_ids(&fallback), expected.iter().map(|(id, _)| *id).collect::<Vec<_>>());
}

#[tokio::test]
async fn dimension_mismatch_is_rejected() {
    let (_db, store) = open_store(schema());
    store.enable_index("doc_embeddings").await.unwrap();

    let err = store.save(&Record::new("Doc").with("id", 1i64).with("embedding", vec![1.0f32; 3])).await.unwrap_err();
    assert!(matches!(err, StoreError::Index(IndexError::VectorDimension { expected: DIMS, got: 3, .. })));

    let err = store.query("Doc").nearest("doc_embeddings", vec![0.0; 3], K).execute().await.unwrap_err();
    assert!(matches!(
        err,
        QueryError::Index(IndexError::VectorDimension { .. }) | QueryError::Store(StoreError::Index(IndexError::VectorDimension { .. }))
    ));
}

#[tokio::test]
async fn reset_returns_index_to_empty_write_only() {
    let (_db, store) = open_store(schema());
    store.enable_index("doc_embeddings").await.unwrap();
    populate(&store).await;

    let policy = IndexerPolicy { enable_write_only: false, ..IndexerPolicy::default() };
    let indexer = OnlineIndexer::new(store.clone(), "doc_embeddings", policy).unwrap();
    indexer.build().await.unwrap();
    assert!(!keel_tests::dump_index(&store, "doc_embeddings").await.is_empty());

    indexer.reset_vector_index().await.unwrap();
    assert_eq!(store.index_state("doc_embeddings").await.unwrap(), keel_core::index::IndexState::WriteOnly);
    assert!(keel_tests::dump_index(&store, "doc_embeddings").await.is_empty());
}
