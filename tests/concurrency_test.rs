mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use jsonlt::lock::lock_path_for;
use jsonlt::{Error, FileLock, Key, Table, TableOptions};
use serde_json::json;

use common::*;

#[test]
fn test_second_handle_sees_appends_without_reopening() {
    let (_dir, path, mut writer) = create_table("shared.jsonlt");
    let mut reader = open_existing(&path);
    assert!(reader.is_empty().unwrap());

    writer.put(json!({"id": "x", "v": 1})).unwrap();
    assert_eq!(reader.get("x").unwrap().unwrap()["v"], 1);

    writer.put(json!({"id": "x", "v": 2})).unwrap();
    writer.delete("x").unwrap();
    writer.put(json!({"id": "y"})).unwrap();
    assert!(!reader.has("x").unwrap());
    assert_eq!(reader.len().unwrap(), 1);
}

#[test]
fn test_auto_reload_off_needs_explicit_reload() {
    let (_dir, path, mut writer) = create_table("shared.jsonlt");
    let mut reader = Table::open(&path, TableOptions::new().auto_reload(false)).unwrap();

    writer.put(json!({"id": 1})).unwrap();
    assert!(!reader.has(1).unwrap());

    reader.reload().unwrap();
    assert!(reader.has(1).unwrap());
}

#[test]
fn test_writers_interleave_through_the_lock() {
    let (_dir, path, mut a) = create_table("shared.jsonlt");
    let mut b = open_existing(&path);

    a.put(json!({"id": 1, "by": "a"})).unwrap();
    b.put(json!({"id": 2, "by": "b"})).unwrap();
    a.put(json!({"id": 3, "by": "a"})).unwrap();

    // Each writer caught up before appending, so both agree with a fresh replay.
    let mut fresh = open_existing(&path);
    for table in [&mut a, &mut b, &mut fresh] {
        assert_eq!(table.len().unwrap(), 3);
    }
    assert_eq!(file_lines(&path).len(), 4);
}

#[test]
fn test_threads_contending_for_the_lock() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let (_dir, path, table) = create_table("shared.jsonlt");
    drop(table);

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut table = open_existing(&path);
                barrier.wait();
                for i in 0..PER_THREAD {
                    table.put(json!({"id": format!("t{t}-{i}"), "n": i})).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let lines = file_lines(&path);
    assert_eq!(lines.len(), 1 + THREADS * PER_THREAD);
    // No line was torn by a concurrent append.
    for line in &lines[1..] {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
    assert_eq!(open_existing(&path).len().unwrap(), THREADS * PER_THREAD);
}

#[test]
fn test_lock_timeout() {
    let (_dir, path) = temp_table_path("t.jsonlt");
    let mut table = Table::open(
        &path,
        TableOptions::new()
            .create(true)
            .key("id")
            .lock_timeout(short_timeout()),
    )
    .unwrap();

    let held = FileLock::acquire(&lock_path_for(&path), Duration::from_secs(1)).unwrap();
    let started = Instant::now();
    match table.put(json!({"id": 1})).unwrap_err() {
        Error::LockTimeout { timeout, .. } => assert_eq!(timeout, short_timeout()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(started.elapsed() >= short_timeout());
    assert!(table.put(json!({"id": 1})).unwrap_err().is_retryable());

    drop(held);
    table.put(json!({"id": 1})).unwrap();
    assert!(table.has(1).unwrap());
}

#[test]
fn test_external_compaction_is_detected() {
    let (_dir, path, mut a) = create_table("shared.jsonlt");
    for i in 0..5 {
        a.put(json!({"id": i, "v": "old"})).unwrap();
        a.put(json!({"id": i, "v": "new"})).unwrap();
    }
    a.delete(4).unwrap();

    let mut b = open_existing(&path);
    assert_eq!(b.len().unwrap(), 4);

    a.compact().unwrap();

    // b's offsets are stale; it must notice the rewrite and replay in full.
    assert_eq!(b.len().unwrap(), 4);
    assert_eq!(b.get(0).unwrap().unwrap()["v"], "new");

    b.put(json!({"id": 9})).unwrap();
    assert!(a.has(9).unwrap());
    assert_eq!(open_existing(&path).len().unwrap(), 5);
}

#[test]
fn test_external_truncation_is_detected() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": 1})).unwrap();
    table.put(json!({"id": 2})).unwrap();

    write_lines(&path, &[HEADER_ID, "{\"id\":3}"]);

    let mut keys: Vec<Key> = table.keys().unwrap().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec![Key::from(3)]);
}

#[test]
fn test_bad_external_append_keeps_last_good_state() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    table.put(json!({"id": 1})).unwrap();
    let mut reader = Table::open(&path, TableOptions::new().auto_reload(false)).unwrap();

    append_raw(&path, "{\"id\":2}\n{not json}\n");
    assert!(matches!(table.len(), Err(Error::Parse { line: 4, .. })));
    assert!(matches!(reader.reload(), Err(Error::Parse { line: 4, .. })));

    // The failed reload applied nothing, not even the good line before the bad one.
    assert_eq!(reader.len().unwrap(), 1);
    assert!(!reader.has(2).unwrap());
}

#[test]
fn test_partial_line_is_deferred_until_complete() {
    let (_dir, path, mut table) = create_table("t.jsonlt");
    let mut reader = open_existing(&path);

    table.put(json!({"id": 1})).unwrap();
    append_raw(&path, "{\"id\":");
    assert_eq!(reader.len().unwrap(), 1);

    append_raw(&path, "2}\n");
    assert_eq!(reader.len().unwrap(), 2);
    assert!(reader.has(2).unwrap());
}

#[test]
fn test_open_during_concurrent_append() {
    let (_dir, path, mut writer) = create_table("t.jsonlt");
    writer.put(json!({"id": 1})).unwrap();

    // Another process is halfway through writing line 3.
    append_raw(&path, "{\"id\":2,\"na");
    let mut reader = open_existing(&path);
    assert_eq!(reader.len().unwrap(), 1);
    assert!(!reader.has(2).unwrap());

    append_raw(&path, "me\":\"bob\"}\n");
    assert_eq!(reader.get(2).unwrap().unwrap()["name"], "bob");
    assert_eq!(reader.len().unwrap(), 2);
}
