//! Workspace lifecycle: content addressing, initialization, renames,
//! repair, and the state point cache.

use serde_json::{json, Map, Value};
use serial_test::serial;
use signac::{calc_id, Error, JobId, Project};
use std::fs;

fn sp(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("state points are objects")
}

fn project() -> (tempfile::TempDir, Project) {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    (dir, project)
}

#[test]
fn content_addressing_is_deterministic() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 1, "b": 2}))).unwrap();
    // md5 of the canonical encoding {"a":1,"b":2}.
    assert_eq!(job.id().as_str(), "608de49a4600dbb5b173492759792e4a");
    assert!(job.path().ends_with("608de49a4600dbb5b173492759792e4a"));

    // Key order does not matter.
    let same = project.open_job(&sp(json!({"b": 2, "a": 1}))).unwrap();
    assert_eq!(job.id(), same.id());
}

#[test]
fn init_materializes_directory_and_is_idempotent() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"n": 7}))).unwrap();
    assert!(!job.is_initialized());

    job.init(false).unwrap();
    assert!(job.is_initialized());
    assert!(job.statepoint_path().is_file());

    let before = fs::read(job.statepoint_path()).unwrap();
    job.init(false).unwrap();
    let after = fs::read(job.statepoint_path()).unwrap();
    assert_eq!(before, after);
    assert_eq!(project.num_jobs().unwrap(), 1);
}

#[test]
fn open_job_rejects_dotted_keys() {
    let (_dir, project) = project();
    assert!(project.open_job(&sp(json!({"a.b": 1}))).is_err());
}

#[test]
fn statepoint_mutation_renames_the_directory() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    fs::write(job.fn_path("artifact.txt"), b"kept").unwrap();
    let old_path = job.path();

    let renamed = job.reset_statepoint(sp(json!({"a": 1}))).unwrap();
    assert_eq!(renamed.id(), &calc_id(&sp(json!({"a": 1}))));
    assert!(!old_path.exists());
    assert!(renamed.path().is_dir());
    assert_eq!(renamed.statepoint().unwrap(), sp(json!({"a": 1})));
    // User data travels with the rename.
    assert_eq!(fs::read(renamed.fn_path("artifact.txt")).unwrap(), b"kept");
}

#[test]
fn statepoint_mutation_refuses_existing_destination() {
    let (_dir, project) = project();
    let a = project.open_job(&sp(json!({"a": 0}))).unwrap();
    let b = project.open_job(&sp(json!({"a": 1}))).unwrap();
    a.init(false).unwrap();
    b.init(false).unwrap();

    let err = a.reset_statepoint(sp(json!({"a": 1}))).unwrap_err();
    assert!(matches!(err, Error::DestinationExists(_)), "got: {err}");
    // Both directories are untouched.
    assert!(a.is_initialized());
    assert!(b.is_initialized());
}

#[test]
fn update_statepoint_preserves_data_and_guards_conflicts() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    fs::write(job.fn_path("data.bin"), b"x").unwrap();

    // Appending a new key is always safe.
    let extended = job.update_statepoint(sp(json!({"b": 1})), false).unwrap();
    assert_eq!(extended.statepoint().unwrap(), sp(json!({"a": 0, "b": 1})));
    assert!(extended.has_file("data.bin"));

    // Changing an existing key requires overwrite.
    assert!(extended
        .update_statepoint(sp(json!({"a": 5})), false)
        .is_err());
    let overwritten = extended.update_statepoint(sp(json!({"a": 5})), true).unwrap();
    assert_eq!(overwritten.statepoint().unwrap(), sp(json!({"a": 5, "b": 1})));
}

#[test]
fn clear_keeps_statepoint_and_document_reset_reinitializes() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    fs::write(job.fn_path("scratch.txt"), b"gone").unwrap();
    fs::create_dir(job.fn_path("subdir")).unwrap();
    let mut document = job.document().unwrap();
    document.insert("x", json!(1)).unwrap();

    job.clear().unwrap();
    assert!(job.is_initialized());
    assert!(!job.has_file("scratch.txt"));
    assert!(!job.fn_path("subdir").exists());
    let mut document = job.document().unwrap();
    assert!(document.is_empty().unwrap());

    job.reset().unwrap();
    assert!(job.is_initialized());
}

#[test]
fn remove_deletes_the_directory() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    job.remove().unwrap();
    assert!(!job.path().exists());
    // Removing again is fine.
    job.remove().unwrap();
}

#[test]
fn open_job_by_id_and_partial_prefix() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    let id = job.id().clone();

    let by_id = project.open_job_by_id(id.as_str()).unwrap();
    assert_eq!(by_id.id(), &id);
    assert_eq!(by_id.statepoint().unwrap(), sp(json!({"a": 0})));

    let by_prefix = project.open_job_by_id(&id.as_str()[..8]).unwrap();
    assert_eq!(by_prefix.id(), &id);

    assert!(matches!(
        project.open_job_by_id("ffffffff"),
        Err(Error::JobNotFound(_))
    ));
}

#[test]
fn ambiguous_prefixes_are_rejected() {
    let (_dir, project) = project();
    for i in 0..64 {
        project
            .open_job(&sp(json!({"i": i})))
            .unwrap()
            .init(false)
            .unwrap();
    }
    // A one-character prefix cannot distinguish 64 jobs.
    let err = project.open_job_by_id("").unwrap_err();
    assert!(matches!(err, Error::AmbiguousJobId(_)), "got: {err}");
    assert!(project.min_len_unique_id().unwrap() > 1);
}

#[test]
fn statepoint_loaded_by_id_is_verified() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    let id = job.id().clone();
    fs::write(job.statepoint_path(), br#"{"a": 999}"#).unwrap();

    // A fresh project has no cache entry, so the read hits the disk and
    // the hash check fails.
    let fresh = Project::open(project.path()).unwrap();
    let reopened = fresh.open_job_by_id(id.as_str()).unwrap();
    assert!(matches!(
        reopened.statepoint(),
        Err(Error::JobsCorrupted(_))
    ));
}

#[test]
fn check_detects_and_repair_fixes_misplaced_jobs() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    let id = job.id().clone();

    let wrong = "0000000000000000000000000000dead";
    let wrong_dir = project.workspace().join(wrong);
    fs::rename(job.path(), &wrong_dir).unwrap();

    let err = project.check().unwrap_err();
    match err {
        Error::JobsCorrupted(ids) => {
            assert_eq!(ids, vec![JobId::parse(wrong).unwrap()]);
        }
        other => panic!("expected JobsCorrupted, got: {other}"),
    }

    project.repair(None).unwrap();
    assert!(!wrong_dir.exists());
    assert!(project.workspace().join(id.as_str()).is_dir());
    project.check().unwrap();
}

#[test]
fn persistent_cache_round_trip() {
    let (_dir, project) = project();
    let mut ids = Vec::new();
    for i in 0..5 {
        let job = project.open_job(&sp(json!({"i": i}))).unwrap();
        job.init(false).unwrap();
        ids.push(job.id().clone());
    }
    let count = project.update_cache().unwrap();
    assert_eq!(count, 5);
    assert!(project.path().join(signac::FN_CACHE).is_file());

    // A fresh project instance resolves state points from the cache even
    // after the state point files are gone.
    for id in &ids {
        fs::remove_file(project.workspace().join(id.as_str()).join(signac::FN_STATE_POINT))
            .unwrap();
    }
    let fresh = Project::open(project.path()).unwrap();
    for (i, id) in ids.iter().enumerate() {
        let job = fresh.open_job_by_id(id.as_str()).unwrap();
        assert_eq!(job.statepoint().unwrap(), sp(json!({"i": i})));
    }

    // Repair rewrites the missing state point files from the cache.
    fresh.repair(None).unwrap();
    fresh.check().unwrap();
    for id in &ids {
        assert!(fresh
            .workspace()
            .join(id.as_str())
            .join(signac::FN_STATE_POINT)
            .is_file());
    }

    project.remove_persistent_cache().unwrap();
    assert!(!project.path().join(signac::FN_CACHE).is_file());
}

#[test]
fn clone_and_move_between_projects() {
    let (_dir_a, source) = project();
    let (_dir_b, destination) = project();

    let job = source.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    fs::write(job.fn_path("payload.txt"), b"data").unwrap();

    let cloned = destination.clone_job(&job).unwrap();
    assert_eq!(cloned.id(), job.id());
    assert!(cloned.has_file("payload.txt"));
    assert!(job.is_initialized());

    // Cloning again collides.
    assert!(matches!(
        destination.clone_job(&job),
        Err(Error::DestinationExists(_))
    ));

    // Moving removes the source directory.
    let (_dir_c, third) = project();
    let moved = job.move_to(&third).unwrap();
    assert!(!job.path().exists());
    assert!(moved.has_file("payload.txt"));
}

#[test]
fn discover_job_from_a_nested_path() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    job.init(false).unwrap();
    let nested = job.fn_path("deep/inside");
    fs::create_dir_all(&nested).unwrap();

    let (found_project, found_id) = Project::discover_job(&nested).unwrap();
    assert_eq!(found_project.path(), project.path());
    assert_eq!(&found_id, job.id());
}

#[test]
#[serial]
fn enter_restores_the_working_directory() {
    let (_dir, project) = project();
    let job = project.open_job(&sp(json!({"a": 0}))).unwrap();
    let before = std::env::current_dir().unwrap();
    {
        let _guard = job.enter().unwrap();
        let inside = std::env::current_dir().unwrap();
        assert_eq!(inside, fs::canonicalize(job.path()).unwrap());
    }
    assert_eq!(std::env::current_dir().unwrap(), before);
}

#[test]
fn job_equality_uses_id_and_path() {
    let (_dir, project) = project();
    let a = project.open_job(&sp(json!({"a": 0}))).unwrap();
    let b = project.open_job(&sp(json!({"a": 0}))).unwrap();
    let c = project.open_job(&sp(json!({"a": 1}))).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn workspace_error_for_broken_symlink() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    fs::remove_dir_all(project.workspace()).unwrap();
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(dir.path().join("nowhere"), project.workspace()).unwrap();
        assert!(matches!(project.job_ids(), Err(Error::Workspace(_))));
    }
}
