//! Workspace import and export.
//!
//! Export maps every job to a destination subpath (derived from its state
//! point, its id, a template, or a callable) and writes the data space
//! into a directory or an archive. Import walks an arbitrary directory
//! layout (or an unpacked archive) and materializes the discovered state
//! points as jobs.

use crate::error::{Error, Result};
use crate::job::Job;
use crate::project::Project;
use crate::schema::ProjectSchema;
use crate::statepoint::FN_STATE_POINT;
use crate::sync::copy_dir_all;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde_json::{Map, Value};
use signac_ids::JobId;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// How to derive the destination subpath of a job on export.
pub enum ExportPath {
    /// `key/value` segments for every state point key that varies across
    /// the exported jobs; jobs without variable keys use their id.
    Auto,
    /// The job id.
    JobId,
    /// A template with `{key}` substitutions; `{id}` inserts the job id
    /// and `{{auto}}` expands the remaining variable keys.
    Template(String),
    /// A callable computing the subpath.
    With(Box<dyn for<'a> Fn(&Job<'a>) -> Result<String>>),
}

/// Export jobs into `target`, a directory or archive
/// (`.zip`, `.tar`, `.tar.gz`/`.tgz`, `.tar.bz2`, `.tar.xz`).
///
/// Returns pairs of source job directory and destination subpath.
pub fn export_jobs(
    jobs: &[Job<'_>],
    target: &Path,
    path_spec: ExportPath,
) -> Result<Vec<(PathBuf, String)>> {
    let variable_keys = variable_statepoint_keys(jobs)?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut mapping: Vec<(Job<'_>, String)> = Vec::with_capacity(jobs.len());
    for job in jobs {
        let rel = destination_path(job, &path_spec, &variable_keys)?;
        validate_rel_path(&rel)?;
        if !seen.insert(rel.clone()) {
            return Err(Error::InvalidArgument(format!(
                "duplicate export path '{rel}'; the path specification does not uniquely \
                 identify each job"
            )));
        }
        mapping.push((job.clone(), rel));
    }
    check_directory_structure(&mapping)?;

    match ArchiveKind::of(target) {
        ArchiveKind::Directory => {
            for (job, rel) in &mapping {
                let dst = target.join(rel);
                if dst.exists() {
                    return Err(Error::DestinationExists(dst.display().to_string()));
                }
                copy_dir_all(&job.path(), &dst)?;
            }
        }
        ArchiveKind::Zip => export_zip(target, &mapping)?,
        ArchiveKind::Tar => {
            let file = create_target_file(target)?;
            write_tar(file, &mapping)?;
        }
        ArchiveKind::TarGz => {
            let file = create_target_file(target)?;
            write_tar(GzEncoder::new(file, Compression::default()), &mapping)?;
        }
        ArchiveKind::TarBz2 => {
            let file = create_target_file(target)?;
            write_tar(
                bzip2::write::BzEncoder::new(file, bzip2::Compression::default()),
                &mapping,
            )?;
        }
        ArchiveKind::TarXz => {
            let file = create_target_file(target)?;
            write_tar(xz2::write::XzEncoder::new(file, 6), &mapping)?;
        }
    }
    info!(count = mapping.len(), target = %target.display(), "exported jobs");
    Ok(mapping
        .into_iter()
        .map(|(job, rel)| (job.path(), rel))
        .collect())
}

/// Import the data space at `origin` (a directory or archive) into the
/// project.
///
/// Without a schema, directories containing a state point file are
/// imported as jobs. A schema pattern like `"foo/{foo:int}"` instead
/// derives state points from directory paths; supported casts are
/// `:int`, `:float`, `:bool`, and `:str` (the default).
///
/// Returns pairs of source directory and created job id.
pub fn import_into_project(
    project: &Project,
    origin: &Path,
    schema: Option<&str>,
) -> Result<Vec<(PathBuf, JobId)>> {
    if origin.is_file() {
        let staging = tempfile::tempdir().map_err(|err| Error::io(origin, err))?;
        unpack_archive(origin, staging.path())?;
        return import_from_directory(project, staging.path(), schema);
    }
    import_from_directory(project, origin, schema)
}

fn import_from_directory(
    project: &Project,
    origin: &Path,
    schema: Option<&str>,
) -> Result<Vec<(PathBuf, JobId)>> {
    match schema {
        None => import_by_statepoint_files(project, origin),
        Some(pattern) => import_by_path_pattern(project, origin, pattern),
    }
}

fn import_by_statepoint_files(
    project: &Project,
    origin: &Path,
) -> Result<Vec<(PathBuf, JobId)>> {
    let mut imported = Vec::new();
    let mut walker = WalkDir::new(origin).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|err| {
            Error::Workspace(format!("failed to walk '{}': {err}", origin.display()))
        })?;
        if !entry.file_type().is_file() || entry.file_name() != FN_STATE_POINT {
            continue;
        }
        let src_dir = entry
            .path()
            .parent()
            .expect("a state point file has a parent directory")
            .to_path_buf();
        let statepoint = read_statepoint(entry.path())?;
        let id = import_job_directory(project, &src_dir, &statepoint)?;
        debug!(job = %id, from = %src_dir.display(), "imported job");
        imported.push((src_dir, id));
        // Do not descend into the job directory looking for nested jobs.
        walker.skip_current_dir();
    }
    Ok(imported)
}

fn import_by_path_pattern(
    project: &Project,
    origin: &Path,
    pattern: &str,
) -> Result<Vec<(PathBuf, JobId)>> {
    let matcher = PathPattern::compile(pattern)?;
    let mut imported = Vec::new();
    let mut walker = WalkDir::new(origin).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|err| {
            Error::Workspace(format!("failed to walk '{}': {err}", origin.display()))
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(origin)
            .expect("walked entries live under the origin");
        if let Some(statepoint) = matcher.statepoint_for(&rel.to_string_lossy())? {
            let id = import_job_directory(project, entry.path(), &statepoint)?;
            debug!(job = %id, from = %entry.path().display(), "imported job");
            imported.push((entry.path().to_path_buf(), id));
            walker.skip_current_dir();
        }
    }
    Ok(imported)
}

fn import_job_directory(
    project: &Project,
    src_dir: &Path,
    statepoint: &Map<String, Value>,
) -> Result<JobId> {
    let job = project.open_job(statepoint)?;
    let dst_dir = job.path();
    if dst_dir.exists() {
        return Err(Error::DestinationExists(job.id().to_string()));
    }
    copy_dir_all(src_dir, &dst_dir)?;
    job.init(false)?;
    Ok(job.id().clone())
}

fn read_statepoint(path: &Path) -> Result<Map<String, Value>> {
    let bytes = fs::read(path).map_err(|err| Error::io(path, err))?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|err| Error::json(path, err))?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| Error::InvalidArgument(format!("'{}' is not a JSON object", path.display())))
}

// ---------------------------------------------------------------------
// Path derivation
// ---------------------------------------------------------------------

pub(crate) fn variable_statepoint_keys(jobs: &[Job<'_>]) -> Result<Vec<String>> {
    let mut statepoints = Vec::with_capacity(jobs.len());
    for job in jobs {
        statepoints.push(job.statepoint()?);
    }
    let schema = ProjectSchema::detect(&statepoints, true);
    Ok(schema.keys().map(str::to_string).collect())
}

fn destination_path(
    job: &Job<'_>,
    path_spec: &ExportPath,
    variable_keys: &[String],
) -> Result<String> {
    match path_spec {
        ExportPath::JobId => Ok(job.id().to_string()),
        ExportPath::Auto => auto_view_path(job, variable_keys),
        ExportPath::Template(template) => expand_template(job, template, variable_keys),
        ExportPath::With(f) => f(job),
    }
}

/// The automatic `key/value` view path of a job, falling back to its id
/// when no key varies.
pub(crate) fn auto_view_path(job: &Job<'_>, variable_keys: &[String]) -> Result<String> {
    let segments = auto_segments(job, variable_keys, &BTreeSet::new())?;
    if segments.is_empty() {
        Ok(job.id().to_string())
    } else {
        Ok(segments.join("/"))
    }
}

fn auto_segments(
    job: &Job<'_>,
    variable_keys: &[String],
    used: &BTreeSet<String>,
) -> Result<Vec<String>> {
    let statepoint = Value::Object(job.statepoint()?);
    let mut segments = Vec::new();
    for key in variable_keys {
        if used.contains(key) {
            continue;
        }
        if let Some(value) = lookup_dotted(&statepoint, key) {
            segments.push(format!("{key}/{}", render_path_value(&value)));
        }
    }
    Ok(segments)
}

fn expand_template(
    job: &Job<'_>,
    template: &str,
    variable_keys: &[String],
) -> Result<String> {
    const AUTO: &str = "{{auto}}";
    let (body, auto) = match template.find(AUTO) {
        Some(pos) => {
            let mut body = template.to_string();
            body.replace_range(pos..pos + AUTO.len(), "\u{0}auto\u{0}");
            (body, true)
        }
        None => (template.to_string(), false),
    };

    let token = Regex::new(r"\{([^{}]+)\}").expect("token pattern is valid");
    let statepoint = Value::Object(job.statepoint()?);
    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut expanded = String::new();
    let mut last = 0;
    for found in token.captures_iter(&body) {
        let whole = found.get(0).expect("capture 0 always exists");
        expanded.push_str(&body[last..whole.start()]);
        last = whole.end();
        let name = found[1].trim();
        if name == "id" {
            expanded.push_str(job.id().as_str());
            continue;
        }
        let key = name.strip_prefix("sp.").unwrap_or(name);
        let value = lookup_dotted(&statepoint, key).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "the state point of job '{}' has no key '{key}'",
                job.id()
            ))
        })?;
        used.insert(key.to_string());
        expanded.push_str(&render_path_value(&value));
    }
    expanded.push_str(&body[last..]);

    if auto {
        let segments = auto_segments(job, variable_keys, &used)?;
        let auto_part = if segments.is_empty() {
            String::new()
        } else {
            segments.join("/")
        };
        expanded = expanded.replace("\u{0}auto\u{0}", &auto_part);
    }
    Ok(expanded.trim_matches('/').to_string())
}

fn lookup_dotted(root: &Value, dotted: &str) -> Option<Value> {
    let mut current = root;
    for node in dotted.split('.') {
        current = current.as_object()?.get(node)?;
    }
    Some(current.clone())
}

fn render_path_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate_rel_path(rel: &str) -> Result<()> {
    if rel.is_empty() {
        return Err(Error::InvalidArgument(
            "export paths cannot be empty".to_string(),
        ));
    }
    let path = Path::new(rel);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(Error::InvalidArgument(format!(
            "export path '{rel}' must be relative and must not contain '..'"
        )));
    }
    Ok(())
}

/// No destination may be a path prefix of another, or the nested job data
/// would be indistinguishable on re-import.
fn check_directory_structure(mapping: &[(Job<'_>, String)]) -> Result<()> {
    for (_, a) in mapping {
        for (_, b) in mapping {
            if a != b && Path::new(b).starts_with(Path::new(a)) {
                return Err(Error::InvalidArgument(format!(
                    "export path '{a}' is a prefix of '{b}'"
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Archive backends
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Directory,
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

impl ArchiveKind {
    fn of(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            Self::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".bz2") {
            Self::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".xz") {
            Self::TarXz
        } else if name.ends_with(".tar") {
            Self::Tar
        } else {
            Self::Directory
        }
    }
}

fn create_target_file(target: &Path) -> Result<File> {
    if target.exists() {
        return Err(Error::DestinationExists(target.display().to_string()));
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
    }
    File::create(target).map_err(|err| Error::io(target, err))
}

fn write_tar<W: io::Write>(writer: W, mapping: &[(Job<'_>, String)]) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    for (job, rel) in mapping {
        let dir = job.path();
        builder
            .append_dir_all(rel, &dir)
            .map_err(|err| Error::io(&dir, err))?;
    }
    let writer = builder
        .into_inner()
        .map_err(|err| Error::io(Path::new("archive"), err))?;
    // Finish any compression stream by dropping the writer after flush.
    let mut writer = writer;
    writer
        .flush()
        .map_err(|err| Error::io(Path::new("archive"), err))?;
    Ok(())
}

fn export_zip(target: &Path, mapping: &[(Job<'_>, String)]) -> Result<()> {
    let file = create_target_file(target)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (job, rel) in mapping {
        let dir = job.path();
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(|err| {
                Error::Workspace(format!("failed to walk '{}': {err}", dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let sub = entry
                .path()
                .strip_prefix(&dir)
                .expect("walked entries live under the job directory");
            let name = format!("{rel}/{}", sub.to_string_lossy());
            writer
                .start_file(name, options)
                .map_err(|err| Error::InvalidArgument(err.to_string()))?;
            let mut src = File::open(entry.path()).map_err(|err| Error::io(entry.path(), err))?;
            io::copy(&mut src, &mut writer).map_err(|err| Error::io(entry.path(), err))?;
        }
    }
    writer
        .finish()
        .map_err(|err| Error::InvalidArgument(err.to_string()))?;
    Ok(())
}

fn unpack_archive(origin: &Path, staging: &Path) -> Result<()> {
    match ArchiveKind::of(origin) {
        ArchiveKind::Zip => {
            let file = File::open(origin).map_err(|err| Error::io(origin, err))?;
            let mut archive =
                zip::ZipArchive::new(file).map_err(|err| Error::InvalidArgument(err.to_string()))?;
            archive
                .extract(staging)
                .map_err(|err| Error::InvalidArgument(err.to_string()))?;
        }
        ArchiveKind::Tar => {
            let file = File::open(origin).map_err(|err| Error::io(origin, err))?;
            tar::Archive::new(file)
                .unpack(staging)
                .map_err(|err| Error::io(origin, err))?;
        }
        ArchiveKind::TarGz => {
            let file = File::open(origin).map_err(|err| Error::io(origin, err))?;
            tar::Archive::new(GzDecoder::new(file))
                .unpack(staging)
                .map_err(|err| Error::io(origin, err))?;
        }
        ArchiveKind::TarBz2 => {
            let file = File::open(origin).map_err(|err| Error::io(origin, err))?;
            tar::Archive::new(bzip2::read::BzDecoder::new(file))
                .unpack(staging)
                .map_err(|err| Error::io(origin, err))?;
        }
        ArchiveKind::TarXz => {
            let file = File::open(origin).map_err(|err| Error::io(origin, err))?;
            tar::Archive::new(xz2::read::XzDecoder::new(file))
                .unpack(staging)
                .map_err(|err| Error::io(origin, err))?;
        }
        ArchiveKind::Directory => {
            return Err(Error::InvalidArgument(format!(
                "'{}' is not a recognized archive",
                origin.display()
            )))
        }
    }
    Ok(())
}

/// Derives state points from directory paths, e.g. `"foo/{foo:int}"`.
struct PathPattern {
    regex: Regex,
    casts: Vec<(String, ValueCast)>,
}

#[derive(Debug, Clone, Copy)]
enum ValueCast {
    Int,
    Float,
    Bool,
    Str,
}

impl PathPattern {
    fn compile(pattern: &str) -> Result<Self> {
        let token = Regex::new(r"\{([A-Za-z0-9_.]+)(?::(int|float|bool|str))?\}")
            .expect("token pattern is valid");
        let mut regex_src = String::from("^");
        let mut casts = Vec::new();
        let mut last = 0;
        for found in token.captures_iter(pattern) {
            let whole = found.get(0).expect("capture 0 always exists");
            regex_src.push_str(&regex::escape(&pattern[last..whole.start()]));
            last = whole.end();
            let key = found[1].to_string();
            let cast = match found.get(2).map(|m| m.as_str()) {
                Some("int") => ValueCast::Int,
                Some("float") => ValueCast::Float,
                Some("bool") => ValueCast::Bool,
                _ => ValueCast::Str,
            };
            regex_src.push_str(&format!("(?P<f{}>[^/]+)", casts.len()));
            casts.push((key, cast));
        }
        regex_src.push_str(&regex::escape(&pattern[last..]));
        regex_src.push('$');
        if casts.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "the path pattern '{pattern}' contains no state point fields"
            )));
        }
        Ok(Self {
            regex: Regex::new(&regex_src).map_err(|err| Error::Query(err.into()))?,
            casts,
        })
    }

    fn statepoint_for(&self, rel_path: &str) -> Result<Option<Map<String, Value>>> {
        let Some(captures) = self.regex.captures(rel_path) else {
            return Ok(None);
        };
        let mut statepoint = Map::new();
        for (i, (key, cast)) in self.casts.iter().enumerate() {
            let raw = captures
                .name(&format!("f{i}"))
                .expect("capture groups follow the cast table")
                .as_str();
            let value = match cast {
                ValueCast::Int => Value::from(raw.parse::<i64>().map_err(|_| {
                    Error::InvalidArgument(format!("cannot parse '{raw}' as an integer"))
                })?),
                ValueCast::Float => Value::from(raw.parse::<f64>().map_err(|_| {
                    Error::InvalidArgument(format!("cannot parse '{raw}' as a float"))
                })?),
                ValueCast::Bool => Value::from(raw.parse::<bool>().map_err(|_| {
                    Error::InvalidArgument(format!("cannot parse '{raw}' as a boolean"))
                })?),
                ValueCast::Str => Value::from(raw),
            };
            statepoint.insert(key.clone(), value);
        }
        Ok(Some(statepoint))
    }
}
