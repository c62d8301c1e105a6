//! Shared fixtures for the end-to-end test suite.

use std::sync::Arc;

use keel_core::keyexpr::KeyExpression;
use keel_core::kv::Database;
use keel_core::record::FieldwiseCodec;
use keel_core::schema::{IndexDef, RecordType, Schema};
use keel_core::store::RecordStore;
use keel_core::subspace::Subspace;
use keel_core::value::ValueType;
use keel_core::StoreError;
use keel_storage_memory::MemoryDatabase;

/// Best-effort tracing init; repeated calls are fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Fresh store over a fresh in-memory database.
pub fn open_store(schema: Schema) -> (Arc<MemoryDatabase>, RecordStore) {
    init_tracing();
    let db = MemoryDatabase::new();
    let database = Database::new(db.clone());
    let store = RecordStore::new(database, Subspace::new(vec![0x01]), Arc::new(schema), Arc::new(FieldwiseCodec))
        .expect("store construction");
    (db, store)
}

/// The User schema most scenarios run against.
pub fn user_schema() -> Schema {
    Schema::builder(1)
        .record_type(
            RecordType::new("User", KeyExpression::field("id"))
                .field("id", ValueType::Int)
                .field("name", ValueType::String)
                .field("email", ValueType::String)
                .field("age", ValueType::Int),
        )
        .index(IndexDef::value("users_by_email", KeyExpression::field("email")))
        .index(IndexDef::value("users_by_age", KeyExpression::field("age")))
        .index(IndexDef::count("user_count", KeyExpression::literal("users")))
        .build()
        .expect("user schema")
}

/// Flip an index straight to readable, for tests that maintain entries from
/// the first write (enable before inserting, mark readable after).
pub async fn mark_readable(store: &RecordStore, index: &str) -> Result<(), StoreError> {
    let store2 = store.clone();
    let index = index.to_string();
    store
        .database()
        .with_txn(move |txn| {
            let store = store2.clone();
            let index = index.clone();
            Box::pin(async move { Ok::<_, StoreError>(store.state_manager().mark_readable(txn, &index).await?) })
        })
        .await
}

/// Enable every named index before any data exists, so saves maintain them,
/// then mark them readable.
pub async fn activate_indexes(store: &RecordStore, names: &[&str]) {
    for name in names {
        store.enable_index(name).await.expect("enable index");
        mark_readable(store, name).await.expect("mark readable");
    }
}

/// All raw entries under an index's subspace, for content comparisons.
pub async fn dump_index(store: &RecordStore, index: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    use keel_core::kv::RangeScanner;
    let subspace = store.index_subspace(index).expect("index subspace");
    store
        .database()
        .with_txn(move |txn| {
            let subspace = subspace.clone();
            Box::pin(async move {
                let (lo, hi) = subspace.range();
                let mut scanner = RangeScanner::over(lo, hi, true);
                let mut out = Vec::new();
                while let Some(pair) = scanner.next(txn).await? {
                    out.push(pair);
                }
                Ok::<_, StoreError>(out)
            })
        })
        .await
        .expect("dump index")
}
