//! One-way synchronization of jobs and projects.
//!
//! Synchronization merges a source workspace into a destination: jobs
//! missing from the destination are cloned whole, existing jobs are merged
//! file by file. Conflicting files are resolved by a [`FileStrategy`],
//! conflicting document keys by a [`DocStrategy`]; unresolved conflicts
//! surface as errors. A dry run routes every mutation through a proxy that
//! logs the intended operation and leaves the disk untouched.

use crate::error::{Error, Result};
use crate::job::{Job, FN_DOCUMENT};
use crate::project::Project;
use crate::statepoint::FN_STATE_POINT;
use regex::Regex;
use serde_json::{Map, Value};
use signac_ids::JobId;
use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Resolution strategy for files that exist on both sides with different
/// content.
pub enum FileStrategy {
    /// The source always wins.
    Always,
    /// The destination always wins.
    Never,
    /// The source wins iff its modification time is strictly newer.
    ByTimestamp,
    /// Ask interactively, caching the answer per file basename.
    Ask {
        yes: HashSet<String>,
        no: HashSet<String>,
    },
    /// Decide with a callable receiving the source path, the destination
    /// path, and the relative file name.
    With(Box<dyn FnMut(&Path, &Path, &str) -> bool + Send>),
}

impl FileStrategy {
    pub fn ask() -> Self {
        Self::Ask {
            yes: HashSet::new(),
            no: HashSet::new(),
        }
    }

    fn resolve(&mut self, src: &Path, dst: &Path, name: &str) -> Result<bool> {
        match self {
            Self::Always => Ok(true),
            Self::Never => Ok(false),
            Self::ByTimestamp => {
                let mtime = |path: &Path| {
                    fs::metadata(path)
                        .and_then(|meta| meta.modified())
                        .map_err(|err| Error::io(path, err))
                };
                Ok(mtime(src)? > mtime(dst)?)
            }
            Self::Ask { yes, no } => {
                let basename = Path::new(name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.to_string());
                if yes.contains(&basename) {
                    return Ok(true);
                }
                if no.contains(&basename) {
                    return Ok(false);
                }
                let overwrite = query_yes_no(&format!("Overwrite files named '{basename}'?"))?;
                if overwrite {
                    yes.insert(basename);
                } else {
                    no.insert(basename);
                }
                Ok(overwrite)
            }
            Self::With(f) => Ok(f(src, dst, name)),
        }
    }
}

impl std::fmt::Debug for FileStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Always => "Always",
            Self::Never => "Never",
            Self::ByTimestamp => "ByTimestamp",
            Self::Ask { .. } => "Ask",
            Self::With(_) => "With",
        };
        write!(f, "FileStrategy::{name}")
    }
}

/// Resolution strategy for job and project documents.
pub enum DocStrategy {
    /// Leave the destination document alone.
    NoSync,
    /// Overwrite destination keys from the source.
    Update,
    /// Treat the document file like any other file.
    Copy,
    /// Merge key by key; an optional predicate selects which conflicting
    /// keys the source may overwrite. Without a predicate, conflicting
    /// keys are a [`Error::DocumentSyncConflict`].
    ByKey(Option<Box<dyn Fn(&str) -> bool + Send>>),
}

impl DocStrategy {
    /// A `ByKey` strategy whose predicate matches dotted key paths
    /// against a regular expression (anchored at the start).
    pub fn by_key_regex(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(signac_query::QueryError::from)?;
        Ok(Self::ByKey(Some(Box::new(move |key: &str| {
            regex.find(key).is_some_and(|m| m.start() == 0)
        }))))
    }
}

impl std::fmt::Debug for DocStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoSync => "NoSync",
            Self::Update => "Update",
            Self::Copy => "Copy",
            Self::ByKey(_) => "ByKey",
        };
        write!(f, "DocStrategy::{name}")
    }
}

/// Counters accumulated over one synchronization run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub files_copied: usize,
    pub bytes_copied: u64,
}

/// Options controlling a synchronization run.
#[derive(Debug)]
pub struct SyncOptions {
    pub strategy: Option<FileStrategy>,
    /// Regular expressions matched against file basenames; matches are
    /// skipped.
    pub exclude: Vec<String>,
    pub doc_strategy: DocStrategy,
    /// Restrict the run to these job ids.
    pub selection: Option<HashSet<JobId>>,
    /// Refuse to synchronize projects whose schemas differ.
    pub check_schema: bool,
    /// Log every intended mutation without touching the disk.
    pub dry_run: bool,
    stats: SyncStats,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            exclude: Vec::new(),
            doc_strategy: DocStrategy::ByKey(None),
            selection: None,
            check_schema: true,
            dry_run: false,
            stats: SyncStats::default(),
        }
    }
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: FileStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_exclude(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_doc_strategy(mut self, strategy: DocStrategy) -> Self {
        self.doc_strategy = strategy;
        self
    }

    pub fn with_selection(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.selection = Some(ids.into_iter().collect());
        self
    }

    pub fn without_schema_check(mut self) -> Self {
        self.check_schema = false;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    fn compiled_excludes(&self) -> Result<Vec<Regex>> {
        self.exclude
            .iter()
            .map(|pattern| Regex::new(pattern).map_err(|err| Error::Query(err.into())))
            .collect()
    }
}

/// File mutation proxy: performs copies and deletions, or only logs them
/// in dry-run mode.
struct FileModifyProxy {
    dry_run: bool,
}

impl FileModifyProxy {
    fn copy(&self, src: &Path, dst: &Path, stats: &mut SyncStats) -> Result<()> {
        debug!(src = %src.display(), dst = %dst.display(), dry_run = self.dry_run, "copy file");
        if self.dry_run {
            return Ok(());
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
        }
        let bytes = fs::copy(src, dst).map_err(|err| Error::io(src, err))?;
        stats.files_copied += 1;
        stats.bytes_copied += bytes;
        Ok(())
    }

    fn make_dir(&self, dir: &Path) -> Result<()> {
        debug!(dir = %dir.display(), dry_run = self.dry_run, "create directory");
        if self.dry_run {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))
    }
}

/// Synchronize the data of `src` into `dst`, file by file.
pub fn sync_jobs(src: &Job<'_>, dst: &Job<'_>, options: &mut SyncOptions) -> Result<()> {
    let src_dir = src.path();
    if !src_dir.is_dir() {
        // Nothing to do for an uninitialized source.
        return Ok(());
    }
    if options.dry_run {
        debug!(job = %src.id(), "synchronizing job (dry run)");
    } else {
        debug!(job = %src.id(), "synchronizing job");
        dst.init(false)?;
    }

    let excludes = options.compiled_excludes()?;
    let doc_as_file = matches!(options.doc_strategy, DocStrategy::Copy);
    let proxy = FileModifyProxy {
        dry_run: options.dry_run,
    };
    let dst_dir = dst.path();

    let mut walker = WalkDir::new(&src_dir).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|err| {
            Error::Workspace(format!("failed to walk '{}': {err}", src_dir.display()))
        })?;
        let rel = entry
            .path()
            .strip_prefix(&src_dir)
            .expect("walked entries live under the source directory");
        let basename = entry.file_name().to_string_lossy();

        if excludes.iter().any(|regex| regex.is_match(&basename)) {
            debug!(file = %rel.display(), "skipped (excluded)");
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        if rel == Path::new(FN_STATE_POINT) || (!doc_as_file && rel == Path::new(FN_DOCUMENT)) {
            continue;
        }

        let dst_path = dst_dir.join(rel);
        if entry.file_type().is_dir() {
            proxy.make_dir(&dst_path)?;
            continue;
        }

        let src_path = entry.path();
        if !dst_path.exists() {
            proxy.copy(src_path, &dst_path, &mut options.stats)?;
        } else if files_differ(src_path, &dst_path)? {
            let resolved = match options.strategy.as_mut() {
                None => return Err(Error::FileSyncConflict(rel.to_path_buf())),
                Some(strategy) => {
                    strategy.resolve(src_path, &dst_path, &rel.to_string_lossy())?
                }
            };
            if resolved {
                proxy.copy(src_path, &dst_path, &mut options.stats)?;
            } else {
                debug!(file = %rel.display(), "skipped by strategy");
            }
        }
    }

    // Document handles are opened directly on the file paths so a dry run
    // cannot materialize job directories as a side effect.
    let mut src_doc = signac_synced::SyncedJson::dict(src.document_path());
    sync_documents(
        &mut SyncedDocPair {
            src: src_doc.to_map()?,
            dst: signac_synced::SyncedJson::dict(dst.document_path()),
        },
        options,
    )
}

struct SyncedDocPair {
    src: Map<String, Value>,
    dst: signac_synced::SyncedJson,
}

fn sync_documents(pair: &mut SyncedDocPair, options: &mut SyncOptions) -> Result<()> {
    match &options.doc_strategy {
        DocStrategy::NoSync | DocStrategy::Copy => Ok(()),
        DocStrategy::Update => {
            let original = pair.dst.to_map()?;
            let mut merged = original.clone();
            for (key, value) in &pair.src {
                merged.insert(key.clone(), value.clone());
            }
            debug!(dry_run = options.dry_run, "updating document from source");
            if !options.dry_run && merged != original {
                pair.dst.reset(Value::Object(merged))?;
            }
            Ok(())
        }
        DocStrategy::ByKey(predicate) => {
            let original = pair.dst.to_map()?;
            let mut merged = original.clone();
            let mut skipped = Vec::new();
            merge_by_key(
                &pair.src,
                &mut merged,
                predicate.as_deref(),
                "",
                &mut skipped,
            );
            if !skipped.is_empty() {
                if predicate.is_none() {
                    return Err(Error::DocumentSyncConflict(skipped));
                }
                debug!(keys = ?skipped, "skipped conflicting document keys");
            }
            if !options.dry_run && merged != original {
                pair.dst.reset(Value::Object(merged))?;
            }
            Ok(())
        }
    }
}

/// Merge `src` into `dst` key by key. Conflicting keys are overwritten
/// only when the predicate approves; nested mappings merge recursively.
fn merge_by_key(
    src: &Map<String, Value>,
    dst: &mut Map<String, Value>,
    predicate: Option<&(dyn Fn(&str) -> bool + Send)>,
    prefix: &str,
    skipped: &mut Vec<String>,
) {
    for (key, value) in src {
        let dotted = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match dst.get_mut(key) {
            Some(existing) if existing == value => continue,
            Some(existing) => {
                if let (Some(src_map), Some(dst_map)) = (value.as_object(), existing.as_object_mut())
                {
                    merge_by_key(src_map, dst_map, predicate, &dotted, skipped);
                    continue;
                }
                if predicate.map_or(true, |pred| !pred(&dotted)) {
                    skipped.push(dotted);
                    continue;
                }
                dst.insert(key.clone(), value.clone());
            }
            None => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Synchronize every job of `source` into `destination`.
pub fn sync_projects(
    source: &Project,
    destination: &Project,
    options: &mut SyncOptions,
) -> Result<()> {
    if source.path() == destination.path() {
        return Err(Error::InvalidArgument(
            "source and destination cannot be the same project".to_string(),
        ));
    }

    if options.check_schema {
        let schema_src = source.detect_schema(false, None)?;
        let schema_dst = destination.detect_schema(false, None)?;
        if !schema_src.is_empty()
            && !schema_dst.is_empty()
            && (!schema_src.difference(&schema_dst, false).is_empty()
                || !schema_dst.difference(&schema_src, false).is_empty())
        {
            return Err(Error::SchemaSyncConflict);
        }
    }

    info!(
        source = %source.path().display(),
        destination = %destination.path().display(),
        dry_run = options.dry_run,
        "synchronizing project"
    );

    // Merge the project documents first.
    sync_documents(
        &mut SyncedDocPair {
            src: {
                let mut doc = source.document();
                doc.to_map()?
            },
            dst: destination.document(),
        },
        options,
    )?;

    let mut cloned = 0usize;
    let mut merged = 0usize;
    let cursor = source.jobs();
    for src_job in cursor.iter()? {
        if let Some(selection) = &options.selection {
            if !selection.contains(src_job.id()) {
                continue;
            }
        }
        if destination.contains_id(src_job.id()) {
            let dst_job = Job::new(destination, src_job.id().clone());
            sync_jobs(&src_job, &dst_job, options)?;
            merged += 1;
        } else if options.dry_run {
            debug!(job = %src_job.id(), "would clone job (dry run)");
            cloned += 1;
        } else {
            destination.clone_job(&src_job)?;
            cloned += 1;
        }
    }
    info!(
        cloned,
        merged,
        files = options.stats.files_copied,
        bytes = options.stats.bytes_copied,
        "synchronization finished"
    );
    Ok(())
}

pub(crate) fn files_differ(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = fs::metadata(a).map_err(|err| Error::io(a, err))?;
    let meta_b = fs::metadata(b).map_err(|err| Error::io(b, err))?;
    if meta_a.len() != meta_b.len() {
        return Ok(true);
    }
    let bytes_a = fs::read(a).map_err(|err| Error::io(a, err))?;
    let bytes_b = fs::read(b).map_err(|err| Error::io(b, err))?;
    Ok(bytes_a != bytes_b)
}

/// Recursively copy a directory tree.
pub(crate) fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|err| Error::io(dst, err))?;
    for entry in fs::read_dir(src).map_err(|err| Error::io(src, err))? {
        let entry = entry.map_err(|err| Error::io(src, err))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|err| Error::io(&src_path, err))?;
        }
    }
    Ok(())
}

fn query_yes_no(question: &str) -> Result<bool> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        write!(stdout, "{question} [y/N] ").ok();
        stdout.flush().ok();
        let mut answer = String::new();
        stdin
            .lock()
            .read_line(&mut answer)
            .map_err(|err| Error::io(Path::new("stdin"), err))?;
        match answer.trim().to_lowercase().as_str() {
            "" | "n" | "no" => return Ok(false),
            "y" | "ye" | "yes" => return Ok(true),
            _ => {
                writeln!(stdout, "Please respond with 'yes' or 'no'.").ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_by_key_recurses_and_collects_conflicts() {
        let src = json!({"a": 1, "nested": {"x": 1, "y": 2}, "conflict": "src"})
            .as_object()
            .cloned()
            .unwrap();
        let mut dst = json!({"nested": {"x": 1, "y": 3}, "conflict": "dst"})
            .as_object()
            .cloned()
            .unwrap();
        let mut skipped = Vec::new();
        merge_by_key(&src, &mut dst, None, "", &mut skipped);
        skipped.sort();
        assert_eq!(skipped, ["conflict", "nested.y"]);
        assert_eq!(dst.get("a"), Some(&json!(1)));
        assert_eq!(dst.get("conflict"), Some(&json!("dst")));
    }

    #[test]
    fn merge_by_key_predicate_selects_overwrites() {
        let src = json!({"keep": 1, "take": 2}).as_object().cloned().unwrap();
        let mut dst = json!({"keep": 0, "take": 0}).as_object().cloned().unwrap();
        let mut skipped = Vec::new();
        let predicate: &(dyn Fn(&str) -> bool + Send) = &|key: &str| key == "take";
        merge_by_key(&src, &mut dst, Some(predicate), "", &mut skipped);
        assert_eq!(skipped, ["keep"]);
        assert_eq!(dst.get("keep"), Some(&json!(0)));
        assert_eq!(dst.get("take"), Some(&json!(2)));
    }
}
