//! Covering indexes answer queries without fetching records.

use keel_core::keyexpr::KeyExpression;
use keel_core::query::Predicate;
use keel_core::record::{BincodeCodec, Record};
use keel_core::schema::{IndexDef, RecordType, Schema};
use keel_core::store::RecordStore;
use keel_core::subspace::Subspace;
use keel_core::value::Value;
use keel_core::ValueType;
use keel_storage_memory::MemoryDatabase;
use keel_tests::{activate_indexes, open_store};
use std::sync::Arc;

fn schema() -> Schema {
    Schema::builder(1)
        .record_type(
            RecordType::new("User", KeyExpression::field("id"))
                .field("id", ValueType::Int)
                .field("email", ValueType::String)
                .field("age", ValueType::Int),
        )
        .index(
            IndexDef::covering("email_lookup", KeyExpression::field("email"), KeyExpression::fields(["age"]))
                .for_types(["User"]),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn covering_plan_reconstructs_records() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["email_lookup"]).await;

    let alice = Record::new("User").with("id", 1i64).with("email", "a@x").with("age", 30i64);
    store.save(&alice).await.unwrap();
    store.save(&Record::new("User").with("id", 2i64).with("email", "b@x").with("age", 25i64)).await.unwrap();

    let explanation = store.query("User").filter(Predicate::field("email").eq("a@x")).explain().await.unwrap();
    assert!(explanation.description.contains("covering"), "got plan {}", explanation.description);

    let results = store.query("User").filter(Predicate::field("email").eq("a@x")).execute().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].field("id"), Some(&Value::Int(1)));
    assert_eq!(results[0].field("email"), Some(&Value::String("a@x".into())));
    assert_eq!(results[0].field("age"), Some(&Value::Int(30)));
}

#[tokio::test]
async fn codec_without_reconstruction_disables_covering_plans() {
    // Same schema, but the plain bincode codec cannot rebuild records
    let db = MemoryDatabase::new();
    let database = keel_core::kv::Database::new(db);
    let store = RecordStore::new(database, Subspace::new(vec![0x01]), Arc::new(schema()), Arc::new(BincodeCodec)).unwrap();
    activate_indexes(&store, &["email_lookup"]).await;

    store.save(&Record::new("User").with("id", 1i64).with("email", "a@x").with("age", 30i64)).await.unwrap();

    let explanation = store.query("User").filter(Predicate::field("email").eq("a@x")).explain().await.unwrap();
    assert!(!explanation.description.contains("covering"), "got plan {}", explanation.description);

    // The non-covering index path still answers correctly
    let results = store.query("User").filter(Predicate::field("email").eq("a@x")).execute().await.unwrap();
    assert_eq!(results.len(), 1);
}
