//! Project-level queries: filters over state points and documents,
//! grouping, and schema detection.

use serde_json::{json, Map, Value};
use signac::{ExportPath, Project};

fn sp(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object")
}

fn filter(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("object")
}

fn project_with_jobs() -> (tempfile::TempDir, Project) {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    for statepoint in [
        json!({"a": 0, "b": 1}),
        json!({"a": 0}),
        json!({"a": 0, "b": {"c": 1}}),
    ] {
        project
            .open_job(&sp(statepoint))
            .unwrap()
            .init(false)
            .unwrap();
    }
    (dir, project)
}

#[test]
fn find_by_statepoint_and_nested_keys() {
    let (_dir, project) = project_with_jobs();

    assert_eq!(project.find_jobs(filter(json!({"a": 0}))).len().unwrap(), 3);
    assert_eq!(
        project.find_jobs(filter(json!({"b.c": 1}))).len().unwrap(),
        1
    );

    let cursor = project.find_jobs(filter(json!({"b": {"$exists": false}})));
    assert_eq!(cursor.len().unwrap(), 1);
    let only = cursor.iter().unwrap().next().unwrap();
    assert_eq!(only.statepoint().unwrap(), sp(json!({"a": 0})));
}

#[test]
fn empty_filter_returns_every_job() {
    let (_dir, project) = project_with_jobs();
    assert_eq!(project.jobs().len().unwrap(), 3);
    assert_eq!(project.find_jobs(Map::new()).len().unwrap(), 3);
}

#[test]
fn doc_prefixed_filters_query_the_document() {
    let (_dir, project) = project_with_jobs();
    let ready = project.open_job(&sp(json!({"a": 0, "b": 1}))).unwrap();
    let mut document = ready.document().unwrap();
    document.insert("ready", json!(true)).unwrap();

    let cursor = project.find_jobs(filter(json!({"doc.ready": true})));
    assert_eq!(cursor.len().unwrap(), 1);
    assert!(cursor.contains(&ready).unwrap());

    // Combined state point and document query.
    let both = project.find_jobs(filter(json!({"a": 0, "doc.ready": true})));
    assert_eq!(both.len().unwrap(), 1);

    let none = project.find_jobs(filter(json!({"a": 1, "doc.ready": true})));
    assert_eq!(none.len().unwrap(), 0);
}

#[test]
fn string_filters_use_the_token_syntax() {
    let (_dir, project) = project_with_jobs();
    assert_eq!(project.find_jobs_from_str("a 0").unwrap().len().unwrap(), 3);
    assert_eq!(project.find_jobs_from_str("b !").unwrap().len().unwrap(), 2);
    assert_eq!(
        project
            .find_jobs_from_str(r#"b.c {"$gte": 1}"#)
            .unwrap()
            .len()
            .unwrap(),
        1
    );
}

#[test]
fn integer_and_float_statepoints_match_either_spelling() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    project
        .open_job(&sp(json!({"x": 4})))
        .unwrap()
        .init(false)
        .unwrap();
    project
        .open_job(&sp(json!({"x": 4.0})))
        .unwrap()
        .init(false)
        .unwrap();

    // The two jobs are distinct on disk but both match both queries.
    assert_eq!(project.num_jobs().unwrap(), 2);
    assert_eq!(project.find_jobs(filter(json!({"x": 4}))).len().unwrap(), 2);
    assert_eq!(
        project.find_jobs(filter(json!({"x": 4.0}))).len().unwrap(),
        2
    );
}

#[test]
fn group_by_statepoint_key() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    for (a, b) in [(0, "x"), (0, "y"), (1, "z")] {
        project
            .open_job(&sp(json!({"a": a, "b": b})))
            .unwrap()
            .init(false)
            .unwrap();
    }

    let cursor = project.jobs();
    let groups = cursor.group_by("a", None).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].0, json!(0));
    assert_eq!(groups[0].1.len(), 2);
    assert_eq!(groups[1].0, json!(1));
    assert_eq!(groups[1].1.len(), 1);
}

#[test]
fn group_by_missing_key_filters_or_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    project
        .open_job(&sp(json!({"a": 0, "tag": "yes"})))
        .unwrap()
        .init(false)
        .unwrap();
    project
        .open_job(&sp(json!({"a": 1})))
        .unwrap()
        .init(false)
        .unwrap();

    let cursor = project.jobs();
    // Without a default the job missing the key is filtered out.
    let groups = cursor.group_by("tag", None).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].1.len(), 1);

    // With a default it lands in the default group.
    let groups = cursor.group_by("tag", Some(json!("none"))).unwrap();
    assert_eq!(groups.len(), 2);
}

#[test]
fn group_by_document_key_and_multiple_keys() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    for (a, status) in [(0, "done"), (1, "done"), (2, "running")] {
        let job = project.open_job(&sp(json!({"a": a}))).unwrap();
        job.init(false).unwrap();
        let mut document = job.document().unwrap();
        document.insert("status", json!(status)).unwrap();
    }

    let cursor = project.jobs();
    let by_doc = cursor.group_by("doc.status", None).unwrap();
    assert_eq!(by_doc.len(), 2);
    assert_eq!(by_doc[0].0, json!("done"));
    assert_eq!(by_doc[0].1.len(), 2);

    let by_pair = cursor.group_by_keys(&["a", "doc.status"], None).unwrap();
    assert_eq!(by_pair.len(), 3);
    assert_eq!(by_pair[0].0, json!([0, "done"]));
}

#[test]
fn group_with_custom_key_function() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::init(dir.path()).unwrap();
    for a in 0..4 {
        project
            .open_job(&sp(json!({"a": a})))
            .unwrap()
            .init(false)
            .unwrap();
    }
    let cursor = project.jobs();
    let groups = cursor
        .group_with(|job| {
            let statepoint = job.statepoint()?;
            let a = statepoint.get("a").and_then(Value::as_i64).unwrap_or(0);
            Ok(Some(json!(a % 2)))
        })
        .unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].1.len(), 2);
}

#[test]
fn detect_schema_over_the_project() {
    let (_dir, project) = project_with_jobs();
    let schema = project.detect_schema(false, None).unwrap();
    assert!(schema.get("a").is_some());
    assert!(schema.get("b").is_some());
    assert!(schema.get("b.c").is_some());

    // "a" is constant across all jobs.
    let varying = project.detect_schema(true, None).unwrap();
    assert!(varying.get("a").is_none());
    assert!(varying.get("b.c").is_some());
}

#[test]
fn cursor_export_rejects_ambiguous_paths() {
    let (_dir, project) = project_with_jobs();
    let target = tempfile::tempdir().unwrap();
    // All three jobs share a == 0, so an `a`-only template collides.
    let err = project
        .export_jobs(target.path().join("out"), ExportPath::Template("a/{a}".into()))
        .unwrap_err();
    assert!(err.to_string().contains("duplicate export path"));
}
