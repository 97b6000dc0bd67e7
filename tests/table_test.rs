mod common;

use std::fs;

use jsonlt::limits::{MAX_KEY_LENGTH, MAX_NESTING_DEPTH, MAX_SAFE_INTEGER};
use jsonlt::{Error, Key, KeyElement, KeySpecifier, Table, TableOptions};
use serde_json::{json, Value};

use common::*;

#[test]
fn test_put_then_get() {
    let (_dir, _path, mut table) = create_table("users.jsonlt");

    table.put(json!({"id": "u1", "name": "Alice"})).unwrap();

    let record = table.get("u1").unwrap().unwrap();
    assert_eq!(Value::Object(record), json!({"id": "u1", "name": "Alice"}));
    assert_eq!(table.len().unwrap(), 1);
}

#[test]
fn test_delete_writes_tombstone() {
    let (_dir, path, mut table) = create_table("users.jsonlt");

    table.put(json!({"id": "u1", "name": "Alice"})).unwrap();
    assert!(table.delete("u1").unwrap());
    assert_eq!(table.get("u1").unwrap(), None);

    let lines = file_lines(&path);
    assert_eq!(lines[0], HEADER_ID);
    assert_eq!(
        &lines[1..],
        &[
            "{\"id\":\"u1\",\"name\":\"Alice\"}".to_string(),
            "{\"id\":\"u1\",\"$deleted\":true}".to_string(),
        ]
    );
}

#[test]
fn test_delete_missing_key_writes_nothing() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    let before = fs::read(&path).unwrap();
    assert!(!table.delete("ghost").unwrap());
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn test_state_survives_reopen() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": 1, "v": "a"})).unwrap();
    table.put(json!({"id": 2, "v": "b"})).unwrap();
    table.put(json!({"id": 1, "v": "c"})).unwrap();
    table.delete(2).unwrap();
    drop(table);

    let mut reopened = open_existing(&path);
    assert_eq!(reopened.len().unwrap(), 1);
    assert_eq!(reopened.get(1).unwrap().unwrap()["v"], "c");
    assert!(!reopened.has(2).unwrap());
}

#[test]
fn test_field_order_preserved() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    table.put(json!({"zeta": 1, "id": "k", "alpha": 2})).unwrap();
    assert_eq!(file_lines(&path)[1], "{\"zeta\":1,\"id\":\"k\",\"alpha\":2}");

    let record = table.get("k").unwrap().unwrap();
    let fields: Vec<&str> = record.keys().map(String::as_str).collect();
    assert_eq!(fields, vec!["zeta", "id", "alpha"]);
}

#[test]
fn test_all_and_keys_in_key_order() {
    let (_dir, _path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": "b"})).unwrap();
    table.put(json!({"id": 10})).unwrap();
    table.put(json!({"id": "a"})).unwrap();
    table.put(json!({"id": 2})).unwrap();

    let ids: Vec<Value> = table.all().unwrap().into_iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(2), json!(10), json!("a"), json!("b")]);

    let mut keys: Vec<Key> = table.keys().unwrap().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec![Key::from(2), Key::from(10), Key::from("a"), Key::from("b")]);
}

#[test]
fn test_find_and_find_one() {
    let (_dir, _path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": "c", "role": "admin"})).unwrap();
    table.put(json!({"id": "a", "role": "user"})).unwrap();
    table.put(json!({"id": "b", "role": "admin"})).unwrap();

    let admins = table.find(|r| r["role"] == "admin").unwrap();
    assert_eq!(admins.len(), 2);
    assert_eq!(admins[0]["id"], "b");

    let first = table.find_one(|r| r["role"] == "admin").unwrap().unwrap();
    assert_eq!(first["id"], "b");
    assert!(table.find_one(|r| r["role"] == "guest").unwrap().is_none());
}

#[test]
fn test_tuple_keys() {
    let (_dir, path) = temp_table_path("t.jsonlt");
    let mut table = Table::open(
        &path,
        TableOptions::new().create(true).key(vec!["org", "id"]),
    )
    .unwrap();

    table.put(json!({"org": "acme", "id": 1, "name": "x"})).unwrap();
    table.put(json!({"org": "acme", "id": 2, "name": "y"})).unwrap();
    assert!(table.delete(Key::tuple([KeyElement::from("acme"), KeyElement::from(1)])).unwrap());

    let lines = file_lines(&path);
    assert_eq!(lines[0], "{\"$jsonlt\":{\"version\":1,\"key\":[\"org\",\"id\"]}}");
    assert_eq!(lines[3], "{\"org\":\"acme\",\"id\":1,\"$deleted\":true}");

    let mut reopened = open_existing(&path);
    assert_eq!(
        reopened.key_specifier(),
        Some(&KeySpecifier::fields(["org", "id"]))
    );
    assert_eq!(reopened.len().unwrap(), 1);
    assert!(matches!(reopened.get("acme"), Err(Error::InvalidKey { .. })));
}

#[test]
fn test_record_validation() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    let before = fs::read(&path).unwrap();

    assert!(matches!(table.put(json!([1, 2])), Err(Error::Validation(_))));
    assert!(matches!(
        table.put(json!({"id": 1, "$meta": true})),
        Err(Error::Validation(_))
    ));
    assert!(matches!(table.put(json!({"name": "no id"})), Err(Error::InvalidKey { .. })));
    assert!(matches!(table.put(json!({"id": 1.5})), Err(Error::InvalidKey { .. })));
    assert!(matches!(table.put(json!({"id": true})), Err(Error::InvalidKey { .. })));
    assert!(matches!(
        table.put(json!({"id": MAX_SAFE_INTEGER + 1})),
        Err(Error::InvalidKey { .. })
    ));

    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn test_integer_key_range_boundaries() {
    let (_dir, _path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": MAX_SAFE_INTEGER})).unwrap();
    table.put(json!({"id": -MAX_SAFE_INTEGER})).unwrap();
    assert!(table.has(MAX_SAFE_INTEGER).unwrap());
    assert!(table.has(-MAX_SAFE_INTEGER).unwrap());
}

#[test]
fn test_key_length_boundary() {
    let (_dir, _path, mut table) = create_table("t.jsonlt");

    // Quotes count toward the serialized length.
    let fits = "k".repeat(MAX_KEY_LENGTH - 2);
    table.put(json!({"id": fits})).unwrap();

    let too_long = "k".repeat(MAX_KEY_LENGTH - 1);
    let err = table.put(json!({"id": too_long})).unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { limit: "key_length", actual: 1025, maximum: 1024 }));
}

#[test]
fn test_nesting_depth_limit() {
    let (_dir, _path, mut table) = create_table("t.jsonlt");

    let nest = |depth: usize| {
        let mut value = json!(0);
        for _ in 0..depth {
            value = json!({"n": value});
        }
        value
    };

    // The record itself is one level.
    let mut ok = nest(MAX_NESTING_DEPTH);
    ok["id"] = json!("ok");
    table.put(ok).unwrap();

    let mut deep = nest(MAX_NESTING_DEPTH + 1);
    deep["id"] = json!("deep");
    assert!(matches!(
        table.put(deep),
        Err(Error::LimitExceeded { limit: "nesting_depth", .. })
    ));
}

#[test]
fn test_read_only_rejects_writes() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": 1})).unwrap();

    let mut ro = Table::open(&path, TableOptions::new().read_only(true)).unwrap();
    assert!(ro.is_read_only());
    assert!(ro.has(1).unwrap());
    assert!(matches!(ro.put(json!({"id": 2})), Err(Error::Validation(_))));
    assert!(matches!(ro.delete(1), Err(Error::Validation(_))));
    assert!(matches!(ro.clear(), Err(Error::Validation(_))));
}

#[test]
fn test_create_with_read_only_is_rejected() {
    let (_dir, path) = temp_table_path("t.jsonlt");
    let err = Table::open(&path, TableOptions::new().create(true).read_only(true)).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(!path.exists());
}

#[test]
fn test_clear_appends_tombstones() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": "b"})).unwrap();
    table.put(json!({"id": "a"})).unwrap();
    table.clear().unwrap();

    assert!(table.is_empty().unwrap());
    let lines = file_lines(&path);
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[3], "{\"id\":\"a\",\"$deleted\":true}");
    assert_eq!(lines[4], "{\"id\":\"b\",\"$deleted\":true}");

    // Clearing an empty table writes nothing.
    table.clear().unwrap();
    assert_eq!(file_lines(&path).len(), 5);
}

#[test]
fn test_malformed_file_fails_open() {
    let cases: &[(&[&str], &str)] = &[
        (&[HEADER_ID, "{\"id\":1", "{\"id\":2}"], "truncated json"),
        (&[HEADER_ID, "", "{\"id\":2}"], "blank line"),
        (&[HEADER_ID, "{\"id\":1,\"id\":2}"], "duplicate field"),
        (&[HEADER_ID, "[1,2]"], "not an object"),
        (&["{\"id\":1}", HEADER_ID], "late header"),
        (&["{\"$jsonlt\":{\"version\":2,\"key\":\"id\"}}"], "unsupported version"),
        (&[HEADER_ID, "{\"id\":1,\"$deleted\":false}"], "bad tombstone"),
    ];

    for (lines, what) in cases {
        let (_dir, path) = temp_table_path("t.jsonlt");
        write_lines(&path, lines);
        match Table::open(&path, TableOptions::new().key("id")) {
            Err(Error::Parse { .. }) => {}
            other => panic!("{what}: expected parse error, got {other:?}"),
        }
    }
}

#[test]
fn test_parse_error_reports_line() {
    let (_dir, path) = temp_table_path("t.jsonlt");
    write_lines(&path, &[HEADER_ID, "{\"id\":1}", "{oops}"]);
    match Table::open(&path, TableOptions::new()).unwrap_err() {
        Error::Parse { line, .. } => assert_eq!(line, 3),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_invalid_utf8_is_parse_error() {
    let (_dir, path) = temp_table_path("t.jsonlt");
    let mut bytes = format!("{HEADER_ID}\n").into_bytes();
    bytes.extend_from_slice(b"{\"id\":\"\xff\"}\n");
    fs::write(&path, bytes).unwrap();
    assert!(matches!(
        Table::open(&path, TableOptions::new()),
        Err(Error::Parse { line: 2, .. })
    ));
}

#[test]
fn test_header_passthrough_fields() {
    let (_dir, path) = temp_table_path("t.jsonlt");
    write_lines(
        &path,
        &[
            "{\"$jsonlt\":{\"version\":1,\"key\":\"id\",\"$schema\":\"https://example.com/s.json\",\"meta\":{\"owner\":\"ops\"}}}",
            "{\"id\":1}",
        ],
    );
    let mut table = Table::open(&path, TableOptions::new()).unwrap();
    let header = table.header().unwrap();
    assert_eq!(header.schema_uri.as_deref(), Some("https://example.com/s.json"));
    assert_eq!(header.meta.as_ref().unwrap()["owner"], "ops");

    // Compaction keeps the header line as it was.
    table.compact().unwrap();
    assert!(file_lines(&path)[0].contains("\"meta\":{\"owner\":\"ops\"}"));
}

#[test]
fn test_lock_file_lives_beside_table() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": 1})).unwrap();
    assert!(path.with_file_name("t.jsonlt.lock").exists());
}
