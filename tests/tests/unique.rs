//! Unique index enforcement.

use keel_core::error::{IndexError, StoreError};
use keel_core::keyexpr::KeyExpression;
use keel_core::record::Record;
use keel_core::schema::{IndexDef, RecordType, Schema};
use keel_core::tuple::Tuple;
use keel_core::value::ValueType;
use keel_tests::{activate_indexes, open_store};

fn schema() -> Schema {
    Schema::builder(1)
        .record_type(
            RecordType::new("User", KeyExpression::field("id"))
                .field("id", ValueType::Int)
                .field("email", ValueType::String),
        )
        .index(IndexDef::unique("unique_email", KeyExpression::field("email")))
        .build()
        .unwrap()
}

#[tokio::test]
async fn second_writer_of_same_value_is_rejected() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["unique_email"]).await;

    store.save(&Record::new("User").with("id", 1i64).with("email", "dup@x")).await.unwrap();

    let err = store.save(&Record::new("User").with("id", 2i64).with("email", "dup@x")).await.unwrap_err();
    assert!(matches!(err, StoreError::Index(IndexError::UniqueViolation { ref index, .. }) if index == "unique_email"));

    // The rejected record must not exist, and the index holds one entry
    assert!(store.get(&Tuple::single(2i64)).await.unwrap().is_none());
    assert_eq!(keel_tests::dump_index(&store, "unique_email").await.len(), 1);
}

#[tokio::test]
async fn updating_own_value_is_allowed() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["unique_email"]).await;

    store.save(&Record::new("User").with("id", 1i64).with("email", "a@x")).await.unwrap();
    // Saving the same record again with the same value is not a violation
    store.save(&Record::new("User").with("id", 1i64).with("email", "a@x")).await.unwrap();
    // Changing the value frees the old one
    store.save(&Record::new("User").with("id", 1i64).with("email", "b@x")).await.unwrap();
    store.save(&Record::new("User").with("id", 2i64).with("email", "a@x")).await.unwrap();

    assert_eq!(keel_tests::dump_index(&store, "unique_email").await.len(), 2);
}
