//! Spatial cell index: nearby lookup and 3D token ordering.

use keel_core::keyexpr::KeyExpression;
use keel_core::record::Record;
use keel_core::schema::{IndexDef, RecordType, Schema, SpatialOptions};
use keel_core::value::ValueType;
use keel_tests::{activate_indexes, open_store};

fn schema() -> Schema {
    Schema::builder(1)
        .record_type(
            RecordType::new("Place", KeyExpression::field("id"))
                .field("id", ValueType::Int)
                .field("lat", ValueType::Float)
                .field("lng", ValueType::Float),
        )
        .index(IndexDef::spatial("places_geo", KeyExpression::fields(["lat", "lng"]), SpatialOptions::level(16)))
        .build()
        .unwrap()
}

fn place(id: i64, lat: f64, lng: f64) -> Record { Record::new("Place").with("id", id).with("lat", lat).with("lng", lng) }

#[tokio::test]
async fn nearby_returns_points_in_the_same_cell() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["places_geo"]).await;

    // Three points within a few hundred meters in Tokyo, one in Paris
    store.save(&place(1, 35.6800, 139.6900)).await.unwrap();
    store.save(&place(2, 35.6810, 139.6910)).await.unwrap();
    store.save(&place(3, 35.6790, 139.6890)).await.unwrap();
    store.save(&place(4, 48.8566, 2.3522)).await.unwrap();

    let found = store.nearby("places_geo", 35.6800, 139.6900, 8).await.unwrap();
    let mut ids: Vec<i64> = found.iter().filter_map(|r| r.field("id").and_then(|v| v.as_i64())).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3]);

    let paris = store.nearby("places_geo", 48.8566, 2.3522, 8).await.unwrap();
    assert_eq!(paris.len(), 1);
}

#[tokio::test]
async fn moving_a_point_updates_its_cell() {
    let (_db, store) = open_store(schema());
    activate_indexes(&store, &["places_geo"]).await;

    store.save(&place(1, 35.6800, 139.6900)).await.unwrap();
    assert_eq!(store.nearby("places_geo", 35.6800, 139.6900, 8).await.unwrap().len(), 1);

    // Move to Paris: old entry goes away, new one appears
    store.save(&place(1, 48.8566, 2.3522)).await.unwrap();
    assert!(store.nearby("places_geo", 35.6800, 139.6900, 8).await.unwrap().is_empty());
    assert_eq!(store.nearby("places_geo", 48.8566, 2.3522, 8).await.unwrap().len(), 1);
}

#[tokio::test]
async fn querying_requires_readable_state() {
    let (_db, store) = open_store(schema());
    store.enable_index("places_geo").await.unwrap();
    store.save(&place(1, 35.68, 139.69)).await.unwrap();

    let err = store.nearby("places_geo", 35.68, 139.69, 8).await.unwrap_err();
    assert!(matches!(
        err,
        keel_core::StoreError::Index(keel_core::IndexError::NotReadable { .. })
    ));
}
