//! Edge case tests for fieldsync-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use fieldsync_engine::{
    FieldChanges, FieldDef, FieldType, JsonCodec, LocalStore, ManualClock, MergeConflict,
    RecordCodec, RecordSchema, RemoteRecord, RowVersion, Schema, StoreSnapshot, UpsertOrigin,
    UpsertPath, DEFAULT_TIE_BREAK,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn store() -> LocalStore {
    LocalStore::new(Arc::new(ManualClock::new(1000)))
}

fn set(field: &str, value: Value) -> FieldChanges {
    FieldChanges::from([(field.to_string(), Some(value))])
}

/// Write locally, prepare, and decode the draft back through the codec.
fn upload_roundtrip(store: &LocalStore, key: &str, field: &str, value: Value) -> RemoteRecord {
    store.write_local(key, "Item", set(field, value));
    let prepared = store.prepare_upload(key).unwrap();
    let codec = JsonCodec::new();
    codec.decode(&codec.encode(prepared.record()).unwrap()).unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_is_a_value() {
    let store = store();
    store.write_local("item1", "Item", set("name", json!("")));

    let row = store.read("item1").unwrap();
    assert_eq!(row.value("name"), Some(&json!("")));

    // Clearing differs from writing an empty string.
    let changed = store.write_local(
        "item1",
        "Item",
        FieldChanges::from([("name".to_string(), None)]),
    );
    assert!(changed.contains("name"));
    assert!(store.read("item1").unwrap().value("name").is_none());
}

#[test]
fn unicode_strings() {
    let store = store();

    let names = [
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Ω≈ç√∫",
        "Hello\nWorld\tTab",
        "Null\0Test",
    ];

    for (i, name) in names.iter().enumerate() {
        let key = format!("item_{}", i);
        let record = upload_roundtrip(&store, &key, "name", json!(name));
        assert_eq!(record.value("name"), Some(&json!(name)), "failed for: {}", name);
    }
}

#[test]
fn very_long_strings() {
    let store = store();
    let long_string = "x".repeat(1024 * 1024);

    let record = upload_roundtrip(&store, "item1", "name", json!(long_string));
    assert_eq!(
        record.value("name").and_then(Value::as_str).map(str::len),
        Some(1024 * 1024)
    );
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let store = store();

    for (i, value) in [i64::MIN, i64::MAX, 0, -1, 1].iter().enumerate() {
        let record = upload_roundtrip(&store, &format!("item_{}", i), "count", json!(value));
        assert_eq!(record.value("count"), Some(&json!(value)));
    }
}

#[test]
fn timestamp_extremes_still_order() {
    let ancestor = RemoteRecord::new("item1", "Item").with_field("x", json!("a"), 0);
    let client = RemoteRecord::new("item1", "Item").with_field("x", json!("b"), u64::MAX);
    let server = RemoteRecord::new("item1", "Item").with_field("x", json!("c"), u64::MAX - 1);

    let resolution = MergeConflict::new(
        "item1",
        RowVersion::from_remote(&ancestor),
        RowVersion::from_remote(&client),
        RowVersion::from_remote(&server),
    )
    .resolve();

    assert_eq!(resolution.value("x"), Some(&json!("b")));
}

#[test]
fn numerically_equal_values_of_different_json_types_conflict() {
    // 1 and 1.0 are different JSON values.
    let ancestor = RemoteRecord::new("item1", "Item").with_field("n", json!(0), 0);
    let client = RemoteRecord::new("item1", "Item").with_field("n", json!(1), 10);
    let server = RemoteRecord::new("item1", "Item").with_field("n", json!(1.0), 20);

    let resolution = MergeConflict::new(
        "item1",
        RowVersion::from_remote(&ancestor),
        RowVersion::from_remote(&client),
        RowVersion::from_remote(&server),
    )
    .resolve();

    assert_eq!(resolution.value("n"), Some(&json!(1.0)));
}

// ============================================================================
// JSON Edge Cases
// ============================================================================

#[test]
fn deeply_nested_json() {
    let store = store();

    let mut nested = json!({"value": "leaf"});
    for _ in 0..50 {
        nested = json!({"nested": nested});
    }

    let record = upload_roundtrip(&store, "item1", "data", nested.clone());
    assert_eq!(record.value("data"), Some(&nested));
}

#[test]
fn json_with_all_types() {
    let store = store();

    let complex_json = json!({
        "string": "hello",
        "number": 42,
        "float": 2.5,
        "bool_true": true,
        "bool_false": false,
        "null": null,
        "array": [1, 2, 3, "mixed", true, null],
        "object": {"a": 1, "b": "two"},
        "empty_array": [],
        "empty_object": {},
    });

    let record = upload_roundtrip(&store, "item1", "data", complex_json.clone());
    assert_eq!(record.value("data"), Some(&complex_json));
}

#[test]
fn nested_values_merge_as_a_whole() {
    let ancestor = RemoteRecord::new("item1", "Item").with_field("doc", json!({"a": 1, "b": 1}), 0);
    let client = RemoteRecord::new("item1", "Item").with_field("doc", json!({"a": 2, "b": 1}), 100);
    let server = RemoteRecord::new("item1", "Item").with_field("doc", json!({"a": 1, "b": 2}), 200);

    let resolution = MergeConflict::new(
        "item1",
        RowVersion::from_remote(&ancestor),
        RowVersion::from_remote(&client),
        RowVersion::from_remote(&server),
    )
    .resolve();

    assert_eq!(resolution.value("doc"), Some(&json!({"a": 1, "b": 2})));
}

// ============================================================================
// Upsert Edge Cases
// ============================================================================

#[test]
fn empty_remote_record_clears_a_synced_row() {
    let store = store();
    let full = RemoteRecord::new("item1", "Item")
        .with_field("name", json!("x"), 10)
        .with_change_tag("t1");
    store
        .apply_upsert(full, UpsertOrigin::Fetch, DEFAULT_TIE_BREAK)
        .unwrap();

    let empty = RemoteRecord::new("item1", "Item").with_change_tag("t2");
    let outcome = store
        .apply_upsert(empty, UpsertOrigin::Fetch, DEFAULT_TIE_BREAK)
        .unwrap();

    assert_eq!(outcome.path, UpsertPath::FastPath);
    assert!(store.read("item1").unwrap().fields.is_empty());
}

#[test]
fn rapid_edits_keep_latest_value_and_time() {
    let clock = Arc::new(ManualClock::new(1000));
    let store = LocalStore::new(clock.clone());

    for i in 1..=100u64 {
        clock.set(1000 + i);
        store.write_local("item1", "Item", set("name", json!(format!("update_{}", i))));
    }

    let record = store.prepare_upload("item1").unwrap().into_record();
    assert_eq!(record.value("name"), Some(&json!("update_100")));
    assert_eq!(record.mod_time_of("name"), 1100);
    assert_eq!(record.overall_mod_time, 1100);
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[test]
fn snapshot_empty_store() {
    let store = store();

    let snapshot = store.export_state();
    assert_eq!(snapshot.row_count(), 0);
    assert_eq!(snapshot.pending_count(), 0);

    let restored = self::store();
    assert!(restored.import_state(snapshot).is_ok());
    assert!(restored.is_empty());
}

#[test]
fn snapshot_keeps_pending_and_synced_rows_apart() {
    let store = store();
    for i in 0..10 {
        let key = format!("item_{}", i);
        if i % 2 == 0 {
            store.write_local(&key, "Item", set("name", json!(key)));
        } else {
            let record = RemoteRecord::new(key.clone(), "Item")
                .with_field("name", json!(key), 5)
                .with_change_tag("t1");
            store
                .apply_upsert(record, UpsertOrigin::Fetch, DEFAULT_TIE_BREAK)
                .unwrap();
        }
    }

    let snapshot = store.export_state();
    assert_eq!(snapshot.row_count(), 10);
    assert_eq!(snapshot.pending_count(), 5);

    let json = snapshot.to_json_pretty().unwrap();
    let restored = StoreSnapshot::from_json(&json).unwrap();
    assert_eq!(restored.pending_count(), 5);
    assert_eq!(restored, snapshot);
}

// ============================================================================
// Schema Edge Cases
// ============================================================================

#[test]
fn schema_with_many_record_types() {
    let schema = (0..100).fold(Schema::new(), |schema, i| {
        schema.with_record_type(RecordSchema::new(
            format!("type_{}", i),
            vec![FieldDef::required("id", FieldType::String)],
        ))
    });
    let codec = JsonCodec::strict(schema);

    for i in 0..100 {
        let record = RemoteRecord::new(format!("record_{}", i), format!("type_{}", i))
            .with_field("id", json!(format!("id_{}", i)), 1);
        let wire = codec.encode(&record).unwrap();
        assert!(codec.decode(&wire).is_ok());
    }
}

#[test]
fn field_with_special_characters_in_name() {
    let names = ["with-dash", "with_underscore", "with.dot", "with spaces", "123numeric"];
    let schema = Schema::new().with_record_type(RecordSchema::new(
        "Item",
        names
            .iter()
            .map(|n| FieldDef::optional(*n, FieldType::String))
            .collect(),
    ));
    let codec = JsonCodec::with_schema(schema);

    let record = names
        .iter()
        .fold(RemoteRecord::new("item1", "Item"), |r, n| {
            r.with_field(*n, json!(n), 1)
        });
    let decoded = codec.decode(&codec.encode(&record).unwrap()).unwrap();
    assert_eq!(decoded, record);
}

// ============================================================================
// Many Rows
// ============================================================================

#[test]
fn many_pending_rows() {
    let store = store();

    for i in 0..1000 {
        store.write_local(&format!("item_{}", i), "Item", set("name", json!(i)));
    }
    assert_eq!(store.pending_keys().len(), 1000);

    for key in store.pending_keys().into_iter().take(500) {
        let prepared = store.prepare_upload(&key).unwrap();
        let confirmed = prepared.into_record().with_change_tag("t1");
        store.confirm_upload(&key, confirmed).unwrap();
    }

    assert_eq!(store.pending_keys().len(), 500);
}

// ============================================================================
// Key Edge Cases
// ============================================================================

#[test]
fn keys_with_special_characters() {
    let store = store();

    let special_keys = [
        "simple",
        "with-dash",
        "with_underscore",
        "with.dots",
        "with/slash",
        "with:colon",
        "with@at",
        "with#hash",
        "uuid-style-550e8400-e29b-41d4-a716-446655440000",
        "emoji-🎉",
        "space test",
        "newline\ntest",
        "",
    ];

    for key in special_keys {
        store.write_local(key, "Item", set("name", json!("test")));
        assert!(store.read(key).is_some(), "could not read key: {:?}", key);
        let prepared = store.prepare_upload(key).unwrap();
        assert_eq!(prepared.record().key, key);
    }
}
