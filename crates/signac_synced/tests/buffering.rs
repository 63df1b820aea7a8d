//! Buffered write-back behavior.
//!
//! The buffer is process-wide state, so every test here runs serially.

use serde_json::json;
use serial_test::serial;
use signac_synced::buffer;
use signac_synced::{buffered, BufferError, SyncedJson};

#[test]
#[serial]
fn nesting_rejects_weakened_force_write() {
    let outer = buffered(false).unwrap();
    assert!(matches!(buffered(true), Err(BufferError::Nesting)));
    let inner = buffered(false).unwrap();
    inner.close().unwrap();
    outer.close().unwrap();
    assert!(!buffer::is_buffered());
}

#[test]
#[serial]
fn force_write_context_allows_nested_non_force() {
    let outer = buffered(true).unwrap();
    let inner = buffered(false).unwrap();
    inner.close().unwrap();
    outer.close().unwrap();
    assert!(!buffer::is_buffered());
}

#[test]
#[serial]
fn writes_are_deferred_until_the_region_exits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let mut doc = SyncedJson::dict(&path);

    let guard = buffered(false).unwrap();
    doc.insert("x", json!(1)).unwrap();
    doc.insert("y", json!([1, 2])).unwrap();
    assert!(!path.exists(), "no data outside the buffer may be modified");
    assert_eq!(doc.get("x").unwrap(), Some(json!(1)));
    guard.close().unwrap();

    let mut reopened = SyncedJson::dict(&path);
    assert_eq!(reopened.snapshot().unwrap(), json!({"x": 1, "y": [1, 2]}));
}

#[test]
#[serial]
fn buffered_result_matches_direct_writes() {
    let dir = tempfile::tempdir().unwrap();
    let direct_path = dir.path().join("direct.json");
    let buffered_path = dir.path().join("buffered.json");

    let mut direct = SyncedJson::dict(&direct_path);
    direct.insert("a", json!(1)).unwrap();
    direct.insert("a", json!(2)).unwrap();
    direct.set_at(&["b", "c"], json!(3)).unwrap();

    let mut deferred = SyncedJson::dict(&buffered_path);
    let guard = buffered(false).unwrap();
    deferred.insert("a", json!(1)).unwrap();
    deferred.insert("a", json!(2)).unwrap();
    deferred.set_at(&["b", "c"], json!(3)).unwrap();
    guard.close().unwrap();

    let direct_bytes = std::fs::read(&direct_path).unwrap();
    let buffered_bytes = std::fs::read(&buffered_path).unwrap();
    assert_eq!(direct_bytes, buffered_bytes);
}

#[test]
#[serial]
fn unmodified_entries_are_not_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let mut doc = SyncedJson::dict(&path);
    doc.insert("a", json!(1)).unwrap();
    let mtime_before = std::fs::metadata(&path).unwrap().modified().unwrap();

    let guard = buffered(false).unwrap();
    // Write the same contents; the flush sees an unchanged hash.
    doc.insert("a", json!(1)).unwrap();
    guard.close().unwrap();

    let mtime_after = std::fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(mtime_before, mtime_after);
}

#[test]
#[serial]
fn external_modification_fails_the_flush_and_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let mut doc = SyncedJson::dict(&path);
    doc.insert("x", json!(0)).unwrap();

    let guard = buffered(false).unwrap();
    doc.insert("x", json!(1)).unwrap();
    // Concurrent external writer replaces the file on disk.
    std::fs::write(&path, br#"{"x": 99}"#).unwrap();
    let err = guard.close().expect_err("flush must detect the external write");
    match err {
        BufferError::Flush(flush) => assert!(flush.contains(&path)),
        other => panic!("expected flush error, got: {other}"),
    }

    // The externally written value survives.
    let mut reopened = SyncedJson::dict(&path);
    assert_eq!(reopened.get("x").unwrap(), Some(json!(99)));
}

#[test]
#[serial]
fn capacity_overflow_forces_a_flush_mid_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let mut doc = SyncedJson::dict(&path);

    let previous = buffer::capacity();
    buffer::set_capacity(8);
    let guard = buffered(false).unwrap();
    doc.insert("k", json!("a long enough value to overflow")).unwrap();
    assert!(path.exists(), "capacity overflow must flush to disk");
    assert_eq!(buffer::buffer_size(), 0);
    guard.close().unwrap();
    buffer::set_capacity(previous);

    let mut reopened = SyncedJson::dict(&path);
    assert_eq!(
        reopened.get("k").unwrap(),
        Some(json!("a long enough value to overflow"))
    );
}

#[test]
#[serial]
fn reads_inside_the_region_prefer_buffered_contents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    let mut doc = SyncedJson::dict(&path);
    doc.insert("x", json!(1)).unwrap();

    let guard = buffered(false).unwrap();
    doc.insert("x", json!(2)).unwrap();
    // A second handle on the same file sees the buffered state.
    let mut other = SyncedJson::dict(&path);
    assert_eq!(other.get("x").unwrap(), Some(json!(2)));
    guard.close().unwrap();
}
