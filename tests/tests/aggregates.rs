//! Count and sum indexes track record changes through atomic adds.

use keel_core::keyexpr::KeyExpression;
use keel_core::record::Record;
use keel_core::schema::{IndexDef, RecordType, Schema};
use keel_core::tuple::Tuple;
use keel_core::value::ValueType;
use keel_tests::{activate_indexes, open_store};

fn schema() -> Schema {
    Schema::builder(1)
        .record_type(
            RecordType::new("Order", KeyExpression::field("id"))
                .field("id", ValueType::Int)
                .field("city", ValueType::String)
                .field("amount", ValueType::Int),
        )
        .index(IndexDef::count("orders_per_city", KeyExpression::field("city")))
        .index(IndexDef::sum("revenue_per_city", KeyExpression::field("city"), "amount"))
        .build()
        .unwrap()
}

fn order(id: i64, city: &str, amount: i64) -> Record {
    Record::new("Order").with("id", id).with("city", city).with("amount", amount)
}

#[tokio::test]
async fn count_and_sum_follow_saves_updates_and_deletes() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["orders_per_city", "revenue_per_city"]).await;

    store.save(&order(1, "Tokyo", 100)).await.unwrap();
    store.save(&order(2, "Tokyo", 250)).await.unwrap();
    store.save(&order(3, "Paris", 40)).await.unwrap();

    let tokyo = Tuple::single("Tokyo");
    let paris = Tuple::single("Paris");
    assert_eq!(store.aggregate("orders_per_city", &tokyo).await.unwrap(), 2);
    assert_eq!(store.aggregate("revenue_per_city", &tokyo).await.unwrap(), 350);
    assert_eq!(store.aggregate("orders_per_city", &paris).await.unwrap(), 1);

    // Update: amount changes, city stays
    store.save(&order(2, "Tokyo", 300)).await.unwrap();
    assert_eq!(store.aggregate("revenue_per_city", &tokyo).await.unwrap(), 400);
    assert_eq!(store.aggregate("orders_per_city", &tokyo).await.unwrap(), 2);

    // Update: record moves between groups
    store.save(&order(3, "Tokyo", 40)).await.unwrap();
    assert_eq!(store.aggregate("orders_per_city", &paris).await.unwrap(), 0);
    assert_eq!(store.aggregate("orders_per_city", &tokyo).await.unwrap(), 3);
    assert_eq!(store.aggregate("revenue_per_city", &tokyo).await.unwrap(), 440);

    // Delete
    store.delete(&Tuple::single(1i64)).await.unwrap();
    assert_eq!(store.aggregate("orders_per_city", &tokyo).await.unwrap(), 2);
    assert_eq!(store.aggregate("revenue_per_city", &tokyo).await.unwrap(), 340);

    // Unknown group reads as zero
    assert_eq!(store.aggregate("orders_per_city", &Tuple::single("Lima")).await.unwrap(), 0);
}
