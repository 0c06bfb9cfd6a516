//! Entity mapping through the public API

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use tablestore::entity::{self, EntityDescriptor, TableEntity, TableRow};
use tablestore::{PropertyValue, ValueKind};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
struct Shipment {
    warehouse: String,
    id: Uuid,
    weight: f64,
    pieces: i64,
    fragile: bool,
    due: chrono::DateTime<Utc>,
    value: Decimal,
    label: Vec<u8>,
    note: Option<String>,
    scratch: String,
}

impl TableEntity for Shipment {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Warehouse", |s: &Self| &s.warehouse, |s: &mut Self, v| s.warehouse = v)
            .row_key("Id", |s: &Self| &s.id, |s: &mut Self, v| s.id = v)
            .property("Weight", |s: &Self| &s.weight, |s: &mut Self, v| s.weight = v)
            .property("Pieces", |s: &Self| &s.pieces, |s: &mut Self, v| s.pieces = v)
            .property("Fragile", |s: &Self| &s.fragile, |s: &mut Self, v| s.fragile = v)
            .property("Due", |s: &Self| &s.due, |s: &mut Self, v| s.due = v)
            .property("Value", |s: &Self| &s.value, |s: &mut Self, v| s.value = v)
            .property("Label", |s: &Self| &s.label, |s: &mut Self, v| s.label = v)
            .property("Note", |s: &Self| &s.note, |s: &mut Self, v| s.note = v)
            .property("Scratch", |s: &Self| &s.scratch, |s: &mut Self, v| s.scratch = v)
            .ignore("Scratch");
    }
}

/// Every row lands in the same partition
#[derive(Debug, Clone, Default, PartialEq)]
struct Setting {
    name: String,
    value: String,
}

impl TableEntity for Setting {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.const_partition_key("settings")
            .row_key("Name", |s: &Self| &s.name, |s: &mut Self, v| s.name = v)
            .property("Value", |s: &Self| &s.value, |s: &mut Self, v| s.value = v);
    }
}

/// Constant partition key next to a member that claims the key's name
#[derive(Debug, Clone, Default, PartialEq)]
struct Tenant {
    partition_key: String,
    id: String,
    plan: String,
}

impl TableEntity for Tenant {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.const_partition_key("tenants")
            .row_key("Id", |t: &Self| &t.id, |t: &mut Self, v| t.id = v)
            .property("PartitionKey", |t: &Self| &t.partition_key, |t: &mut Self, v| {
                t.partition_key = v
            })
            .property("Plan", |t: &Self| &t.plan, |t: &mut Self, v| t.plan = v);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Quote {
    symbol: String,
    venue: String,
    price: Decimal,
}

impl TableEntity for Quote {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Symbol", |q: &Self| &q.symbol, |q: &mut Self, v| q.symbol = v)
            .row_key("Venue", |q: &Self| &q.venue, |q: &mut Self, v| q.venue = v)
            .property("Price", |q: &Self| &q.price, |q: &mut Self, v| q.price = v);
    }
}

/// Non-string keys
#[derive(Debug, Clone, Default, PartialEq)]
struct Reading {
    sensor: i64,
    taken_at: chrono::DateTime<Utc>,
    celsius: f64,
}

impl TableEntity for Reading {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Sensor", |r: &Self| &r.sensor, |r: &mut Self, v| r.sensor = v)
            .row_key("TakenAt", |r: &Self| &r.taken_at, |r: &mut Self, v| r.taken_at = v)
            .property("Celsius", |r: &Self| &r.celsius, |r: &mut Self, v| r.celsius = v);
    }
}

#[derive(Debug, Clone, Default)]
struct NullableKey {
    pk: Option<String>,
    rk: String,
}

impl TableEntity for NullableKey {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Pk", |e: &Self| &e.pk, |e: &mut Self, v| e.pk = v)
            .row_key("Rk", |e: &Self| &e.rk, |e: &mut Self, v| e.rk = v);
    }
}

#[derive(Debug, Clone, Default)]
struct BinaryKey {
    pk: String,
    rk: Vec<u8>,
}

impl TableEntity for BinaryKey {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Pk", |e: &Self| &e.pk, |e: &mut Self, v| e.pk = v)
            .row_key("Rk", |e: &Self| &e.rk, |e: &mut Self, v| e.rk = v);
    }
}

#[derive(Debug, Clone, Default)]
struct DuplicateMember {
    pk: String,
    rk: String,
    a: String,
}

impl TableEntity for DuplicateMember {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Pk", |e: &Self| &e.pk, |e: &mut Self, v| e.pk = v)
            .row_key("Rk", |e: &Self| &e.rk, |e: &mut Self, v| e.rk = v)
            .property("Name", |e: &Self| &e.a, |e: &mut Self, v| e.a = v)
            .property("NAME", |e: &Self| &e.a, |e: &mut Self, v| e.a = v);
    }
}

#[derive(Debug, Clone, Default)]
struct MixedPartition {
    pk: String,
    rk: String,
}

impl TableEntity for MixedPartition {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Pk", |e: &Self| &e.pk, |e: &mut Self, v| e.pk = v)
            .const_partition_key("fixed")
            .row_key("Rk", |e: &Self| &e.rk, |e: &mut Self, v| e.rk = v);
    }
}

#[derive(Debug, Clone, Default)]
struct MissingRowKey {
    pk: String,
}

impl TableEntity for MissingRowKey {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Pk", |e: &Self| &e.pk, |e: &mut Self, v| e.pk = v);
    }
}

fn shipment() -> Shipment {
    Shipment {
        warehouse: "north".into(),
        id: Uuid::new_v4(),
        weight: 12.5,
        pieces: 3,
        fragile: true,
        due: Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap(),
        value: Decimal::from_str("1999.95").unwrap(),
        label: vec![0, 1, 2, 254],
        note: Some("handle with care".into()),
        scratch: "not persisted".into(),
    }
}

#[test]
fn test_entity_maps_to_row_and_back() {
    let original = shipment();
    let row = entity::to_row(&original).unwrap();

    assert_eq!(row.partition_key, "north");
    assert_eq!(row.row_key, original.id.hyphenated().to_string());
    assert_eq!(row.get("weight"), Some(&PropertyValue::Double(12.5)));
    assert_eq!(row.get("Pieces"), Some(&PropertyValue::Int64(3)));
    assert_eq!(row.get("Label"), Some(&PropertyValue::Binary(vec![0, 1, 2, 254])));
    assert!(row.get("Scratch").is_none());

    let restored: Shipment = entity::from_row(&row).unwrap();
    assert_eq!(
        restored,
        Shipment {
            scratch: String::new(),
            ..original
        }
    );
}

#[test]
fn test_absent_optional_members_become_null_markers() {
    let mut original = shipment();
    original.note = None;

    let row = entity::to_row(&original).unwrap();
    assert_eq!(row.get("Note"), Some(&PropertyValue::Null));

    let restored: Shipment = entity::from_row(&row).unwrap();
    assert_eq!(restored.note, None);
}

#[test]
fn test_missing_and_unknown_properties() {
    let row = TableRow::new("north", Uuid::nil().to_string())
        .with_property("Pieces", 7i64)
        .with_property("Colour", "red");

    let restored: Shipment = entity::from_row(&row).unwrap();
    assert_eq!(restored.pieces, 7);
    assert_eq!(restored.weight, 0.0);
    assert_eq!(restored.id, Uuid::nil());
}

#[test]
fn test_property_type_mismatch_is_a_serialization_error() {
    let row = TableRow::new("north", Uuid::nil().to_string()).with_property("Pieces", "many");
    let err = entity::from_row::<Shipment>(&row).unwrap_err();
    assert!(matches!(err, tablestore::Error::Serialization(_)));
}

#[test]
fn test_constant_partition_key() {
    let setting = Setting {
        name: "theme".into(),
        value: "dark".into(),
    };
    let row = entity::to_row(&setting).unwrap();
    assert_eq!(row.partition_key, "settings");
    assert_eq!(row.row_key, "theme");

    let metadata = entity::describe::<Setting>().unwrap();
    assert_eq!(metadata.const_partition_key(), Some("settings"));
    assert_eq!(entity::from_row::<Setting>(&row).unwrap(), setting);
}

#[test]
fn test_constant_partition_key_ignores_same_named_property() {
    let tenant = Tenant {
        partition_key: "elsewhere".into(),
        id: "acme".into(),
        plan: "gold".into(),
    };
    let row = entity::to_row(&tenant).unwrap();
    assert_eq!(row.partition_key, "tenants");
    assert!(row.get("PartitionKey").is_none());
    assert_eq!(row.get("Plan"), Some(&PropertyValue::from("gold")));

    let metadata = entity::describe::<Tenant>().unwrap();
    assert_eq!(metadata.properties().len(), 1);

    let restored: Tenant = entity::from_row(&row).unwrap();
    assert_eq!(restored.partition_key, "");
    assert_eq!(restored.plan, "gold");
}

#[test]
fn test_decimal_keeps_its_precision() {
    let quote = Quote {
        symbol: "EURUSD".into(),
        venue: "lmax".into(),
        price: Decimal::from_str("1.123123123").unwrap(),
    };
    let row = entity::to_row(&quote).unwrap();
    assert_eq!(row.get("Price"), Some(&PropertyValue::Double(1.123123123)));

    let restored: Quote = entity::from_row(&row).unwrap();
    assert_eq!(restored, quote);
    assert_eq!(restored.price.to_string(), "1.123123123");
}

#[test]
fn test_rows_map_in_order_and_stop_at_a_bad_row() {
    let metadata = entity::describe::<Quote>().unwrap();
    let rows = vec![
        TableRow::new("EURUSD", "lmax").with_property("Price", 1.5),
        TableRow::new("GBPUSD", "lmax").with_property("Price", 2i64),
    ];
    let quotes = metadata.from_rows(&rows).unwrap();
    assert_eq!(
        quotes.iter().map(|q| q.symbol.as_str()).collect::<Vec<_>>(),
        ["EURUSD", "GBPUSD"]
    );
    assert_eq!(quotes[1].price, Decimal::from(2));

    let mut bad = rows;
    bad.push(TableRow::new("USDJPY", "lmax").with_property("Price", "cheap"));
    assert!(metadata.from_rows(&bad).is_err());
}

#[test]
fn test_non_string_keys_use_invariant_text() {
    let reading = Reading {
        sensor: 42,
        taken_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        celsius: -3.5,
    };
    let row = entity::to_row(&reading).unwrap();
    assert_eq!(row.partition_key, "42");
    assert_eq!(row.row_key, "2024-01-02T03:04:05.000000000Z");
    assert_eq!(entity::from_row::<Reading>(&row).unwrap(), reading);

    let garbled = TableRow::new("forty-two", "2024-01-02T03:04:05Z");
    assert!(entity::from_row::<Reading>(&garbled).is_err());
}

#[test]
fn test_invalid_registrations() {
    for err in [
        entity::describe::<NullableKey>().err(),
        entity::describe::<BinaryKey>().err(),
        entity::describe::<DuplicateMember>().err(),
        entity::describe::<MixedPartition>().err(),
        entity::describe::<MissingRowKey>().err(),
    ] {
        let err = err.expect("registration should be rejected");
        assert!(err.is_configuration(), "unexpected error: {}", err);
    }
}

#[test]
fn test_metadata_is_shared() {
    let a = entity::describe::<Shipment>().unwrap();
    let b = entity::describe::<Shipment>().unwrap();
    assert!(std::sync::Arc::ptr_eq(&a, &b));

    let kinds: Vec<ValueKind> = a.properties().iter().map(|p| p.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            ValueKind::Double,
            ValueKind::Int64,
            ValueKind::Boolean,
            ValueKind::DateTime,
            ValueKind::Double,
            ValueKind::Binary,
            ValueKind::String,
        ]
    );
    assert_eq!(a.properties()[0].name(), "Weight");
}
