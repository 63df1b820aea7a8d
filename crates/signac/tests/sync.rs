//! Project synchronization: conflicts, strategies, exclusion, selection,
//! and dry runs.

use serde_json::{json, Map, Value};
use signac::{DocStrategy, Error, FileStrategy, Project, SyncOptions};
use std::fs;
use std::thread::sleep;
use std::time::Duration;

fn sp(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object")
}

fn project_pair() -> (tempfile::TempDir, Project, tempfile::TempDir, Project) {
    let dir_src = tempfile::tempdir().unwrap();
    let src = Project::init(dir_src.path()).unwrap();
    let dir_dst = tempfile::tempdir().unwrap();
    let dst = Project::init(dir_dst.path()).unwrap();
    (dir_src, src, dir_dst, dst)
}

#[test]
fn missing_jobs_are_cloned() {
    let (_a, source, _b, destination) = project_pair();
    let job = source.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    fs::write(job.fn_path("result.txt"), b"42").unwrap();

    destination
        .sync_from(&source, &mut SyncOptions::new())
        .unwrap();
    let cloned = destination.open_job_by_id(job.id().as_str()).unwrap();
    assert!(cloned.has_file("result.txt"));
}

#[test]
fn conflicting_files_require_a_strategy() {
    let (_a, source, _b, destination) = project_pair();
    let statepoint = sp(json!({"a": 0}));
    let src_job = source.open_job(&statepoint).unwrap();
    src_job.init(false).unwrap();
    fs::write(src_job.fn_path("f"), b"source").unwrap();
    let dst_job = destination.open_job(&statepoint).unwrap();
    dst_job.init(false).unwrap();
    fs::write(dst_job.fn_path("f"), b"destination").unwrap();

    let err = destination
        .sync_from(&source, &mut SyncOptions::new())
        .unwrap_err();
    match err {
        Error::FileSyncConflict(path) => assert_eq!(path, std::path::PathBuf::from("f")),
        other => panic!("expected FileSyncConflict, got: {other}"),
    }

    // `Never` keeps the destination version.
    destination
        .sync_from(
            &source,
            &mut SyncOptions::new().with_strategy(FileStrategy::Never),
        )
        .unwrap();
    assert_eq!(fs::read(dst_job.fn_path("f")).unwrap(), b"destination");

    // `Always` takes the source version.
    destination
        .sync_from(
            &source,
            &mut SyncOptions::new().with_strategy(FileStrategy::Always),
        )
        .unwrap();
    assert_eq!(fs::read(dst_job.fn_path("f")).unwrap(), b"source");
}

#[test]
fn by_timestamp_copies_only_strictly_newer_files() {
    let (_a, source, _b, destination) = project_pair();
    let statepoint = sp(json!({"a": 0}));
    let src_job = source.open_job(&statepoint).unwrap();
    src_job.init(false).unwrap();
    let dst_job = destination.open_job(&statepoint).unwrap();
    dst_job.init(false).unwrap();

    // The destination copy is newer than the source copy.
    fs::write(src_job.fn_path("f"), b"old").unwrap();
    sleep(Duration::from_millis(20));
    fs::write(dst_job.fn_path("f"), b"new").unwrap();

    destination
        .sync_from(
            &source,
            &mut SyncOptions::new().with_strategy(FileStrategy::ByTimestamp),
        )
        .unwrap();
    assert_eq!(fs::read(dst_job.fn_path("f")).unwrap(), b"new");

    // Now the source is strictly newer and wins.
    sleep(Duration::from_millis(20));
    fs::write(src_job.fn_path("f"), b"newest").unwrap();
    destination
        .sync_from(
            &source,
            &mut SyncOptions::new().with_strategy(FileStrategy::ByTimestamp),
        )
        .unwrap();
    assert_eq!(fs::read(dst_job.fn_path("f")).unwrap(), b"newest");
}

#[test]
fn excluded_files_are_left_alone() {
    let (_a, source, _b, destination) = project_pair();
    let statepoint = sp(json!({"a": 0}));
    let src_job = source.open_job(&statepoint).unwrap();
    src_job.init(false).unwrap();
    fs::write(src_job.fn_path("f"), b"source").unwrap();
    let dst_job = destination.open_job(&statepoint).unwrap();
    dst_job.init(false).unwrap();
    fs::write(dst_job.fn_path("f"), b"destination").unwrap();

    destination
        .sync_from(&source, &mut SyncOptions::new().with_exclude(["^f$"]))
        .unwrap();
    assert_eq!(fs::read(src_job.fn_path("f")).unwrap(), b"source");
    assert_eq!(fs::read(dst_job.fn_path("f")).unwrap(), b"destination");
}

#[test]
fn document_conflicts_surface_skipped_keys() {
    let (_a, source, _b, destination) = project_pair();
    let statepoint = sp(json!({"a": 0}));
    let src_job = source.open_job(&statepoint).unwrap();
    src_job.init(false).unwrap();
    src_job
        .document()
        .unwrap()
        .update(sp(json!({"shared": "src", "only_src": 1})))
        .unwrap();
    let dst_job = destination.open_job(&statepoint).unwrap();
    dst_job.init(false).unwrap();
    dst_job
        .document()
        .unwrap()
        .update(sp(json!({"shared": "dst"})))
        .unwrap();

    let err = destination
        .sync_from(&source, &mut SyncOptions::new())
        .unwrap_err();
    match err {
        Error::DocumentSyncConflict(keys) => assert_eq!(keys, vec!["shared".to_string()]),
        other => panic!("expected DocumentSyncConflict, got: {other}"),
    }

    // `Update` overwrites from the source.
    destination
        .sync_from(
            &source,
            &mut SyncOptions::new().with_doc_strategy(DocStrategy::Update),
        )
        .unwrap();
    let mut document = dst_job.document().unwrap();
    assert_eq!(document.get("shared").unwrap(), Some(json!("src")));
    assert_eq!(document.get("only_src").unwrap(), Some(json!(1)));
}

#[test]
fn by_key_predicate_resolves_selected_conflicts() {
    let (_a, source, _b, destination) = project_pair();
    let statepoint = sp(json!({"a": 0}));
    let src_job = source.open_job(&statepoint).unwrap();
    src_job.init(false).unwrap();
    src_job
        .document()
        .unwrap()
        .update(sp(json!({"take": 1, "keep": 1})))
        .unwrap();
    let dst_job = destination.open_job(&statepoint).unwrap();
    dst_job.init(false).unwrap();
    dst_job
        .document()
        .unwrap()
        .update(sp(json!({"take": 0, "keep": 0})))
        .unwrap();

    destination
        .sync_from(
            &source,
            &mut SyncOptions::new()
                .with_doc_strategy(DocStrategy::by_key_regex("take").unwrap()),
        )
        .unwrap();
    let mut document = dst_job.document().unwrap();
    assert_eq!(document.get("take").unwrap(), Some(json!(1)));
    assert_eq!(document.get("keep").unwrap(), Some(json!(0)));
}

#[test]
fn schema_conflicts_are_refused_unless_disabled() {
    let (_a, source, _b, destination) = project_pair();
    source
        .open_job(&sp(json!({"alpha": 1})))
        .unwrap()
        .init(false)
        .unwrap();
    destination
        .open_job(&sp(json!({"beta": 2})))
        .unwrap()
        .init(false)
        .unwrap();

    let err = destination
        .sync_from(&source, &mut SyncOptions::new())
        .unwrap_err();
    assert!(matches!(err, Error::SchemaSyncConflict), "got: {err}");

    destination
        .sync_from(&source, &mut SyncOptions::new().without_schema_check())
        .unwrap();
    assert_eq!(destination.num_jobs().unwrap(), 2);
}

#[test]
fn selection_restricts_the_sync() {
    let (_a, source, _b, destination) = project_pair();
    let picked = source.open_job(&sp(json!({"a": 0}))).unwrap();
    picked.init(false).unwrap();
    source
        .open_job(&sp(json!({"a": 1})))
        .unwrap()
        .init(false)
        .unwrap();

    destination
        .sync_from(
            &source,
            &mut SyncOptions::new().with_selection([picked.id().clone()]),
        )
        .unwrap();
    assert_eq!(destination.num_jobs().unwrap(), 1);
    assert!(destination.contains_id(picked.id()));
}

#[test]
fn dry_run_touches_nothing() {
    let (_a, source, _b, destination) = project_pair();
    let job = source.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    fs::write(job.fn_path("f"), b"data").unwrap();

    destination
        .sync_from(&source, &mut SyncOptions::new().dry_run())
        .unwrap();
    assert_eq!(destination.num_jobs().unwrap(), 0);
}

#[test]
fn round_trip_sync_is_stable() {
    let (_a, source, _b, destination) = project_pair();
    let job = source.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    fs::write(job.fn_path("f"), b"data").unwrap();
    job.document()
        .unwrap()
        .insert("done", json!(true))
        .unwrap();

    let mut forward = SyncOptions::new()
        .with_strategy(FileStrategy::Always)
        .with_doc_strategy(DocStrategy::Update);
    destination.sync_from(&source, &mut forward).unwrap();

    let snapshot = |project: &Project| {
        let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
        (
            fs::read(job.fn_path("f")).unwrap(),
            job.document().unwrap().snapshot().unwrap(),
        )
    };
    let before = snapshot(&source);

    let mut backward = SyncOptions::new()
        .with_strategy(FileStrategy::Always)
        .with_doc_strategy(DocStrategy::Update);
    source.sync_from(&destination, &mut backward).unwrap();
    assert_eq!(snapshot(&source), before);
}

#[test]
fn syncing_a_project_with_itself_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    let same = Project::open(dir.path()).unwrap();
    assert!(project
        .sync_from(&same, &mut SyncOptions::new())
        .is_err());
}
