//! Buffered document writes at the project level.

use serde_json::{json, Map, Value};
use serial_test::serial;
use signac::{buffered, BufferError, Project};

fn sp(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object")
}

#[test]
#[serial]
fn document_writes_batch_inside_a_buffered_region() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();

    let guard = buffered(false).unwrap();
    let mut document = job.document().unwrap();
    document.insert("x", json!(1)).unwrap();
    document.insert("y", json!(2)).unwrap();
    assert!(!job.document_path().exists());
    guard.close().unwrap();

    let mut reopened = job.document().unwrap();
    assert_eq!(reopened.snapshot().unwrap(), json!({"x": 1, "y": 2}));
}

#[test]
#[serial]
fn external_overwrite_during_buffering_raises_and_wins() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    let mut document = job.document().unwrap();
    document.insert("x", json!(0)).unwrap();

    let guard = buffered(false).unwrap();
    document.insert("x", json!(1)).unwrap();
    // An external writer replaces the document file on disk.
    std::fs::write(job.document_path(), br#"{"x": 1000}"#).unwrap();
    let err = guard.close().expect_err("the flush must detect the overwrite");
    match err {
        BufferError::Flush(flush) => assert!(flush.contains(&job.document_path())),
        other => panic!("expected a flush error, got: {other}"),
    }

    // The externally written value is what a reopen observes.
    let mut reopened = job.document().unwrap();
    assert_eq!(reopened.get("x").unwrap(), Some(json!(1000)));
}
