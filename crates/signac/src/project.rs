//! Projects: workspace ownership, the state point cache, and job lookup.

use crate::config::{
    locate_config_dir, refuse_older_schema, LocatedConfig, ProjectConfig, PROJECT_CONFIG_FN,
};
use crate::cursor::JobsCursor;
use crate::error::{Error, Result};
use crate::export::{self, ExportPath};
use crate::job::{Job, FN_DOCUMENT};
use crate::migrate::SCHEMA_VERSION;
use crate::schema::ProjectSchema;
use crate::statepoint::{StatePointFile, FN_STATE_POINT};
use crate::sync::{self, SyncOptions};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use signac_ids::{calc_id, JobId, JOB_ID_LENGTH};
use signac_query::SearchIndex;
use signac_synced::{no_dot_in_key, replace_file_atomic, SyncedJson};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// File name of the project document.
pub const FN_PROJECT_DOCUMENT: &str = "signac_project_document.json";

/// Relative path of the persistent state point cache.
pub const FN_CACHE: &str = ".signac/statepoint_cache.json.gz";

// Bounded pool size for parallel state point reads during cache refresh.
const CACHE_REFRESH_THREADS: usize = 4;

#[derive(Debug, Default)]
struct StatePointCache {
    entries: HashMap<JobId, Map<String, Value>>,
    read_from_disk: bool,
    misses: usize,
    warned: bool,
}

/// The handle on a project directory.
///
/// A project owns a workspace directory whose entries are job directories
/// named by their state point hashes, and an in-memory state point cache
/// that is lazily populated from the persistent cache file and the
/// workspace.
#[derive(Debug)]
pub struct Project {
    path: PathBuf,
    workspace: PathBuf,
    config: ProjectConfig,
    cache: Mutex<StatePointCache>,
}

impl Project {
    /// Open the project at `path`.
    ///
    /// The directory must already contain a project configuration; use
    /// [`Project::init`] to create one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = crate::config::absolute(path.as_ref());
        if !path.join(PROJECT_CONFIG_FN).is_file() {
            refuse_older_schema(&path)?;
            return Err(Error::Config(format!(
                "unable to find a project at '{}'",
                path.display()
            )));
        }
        let config = ProjectConfig::load(&path)?;
        check_schema_compatibility(&config)?;

        let workspace = path.join("workspace");
        fs::create_dir_all(&workspace).map_err(|err| Error::io(&workspace, err))?;

        Ok(Self {
            path,
            workspace,
            config,
            cache: Mutex::new(StatePointCache::default()),
        })
    }

    /// Initialize a project at `path`, then open it.
    ///
    /// Safe to call repeatedly; an existing configuration is left alone.
    /// A directory carrying an older-schema marker is refused.
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let path = crate::config::absolute(path.as_ref());
        if !path.join(PROJECT_CONFIG_FN).is_file() {
            refuse_older_schema(&path)?;
            ProjectConfig::new().write(&path)?;
            info!(path = %path.display(), "initialized project");
        }
        Self::open(&path)
    }

    /// Search from `start` upward for a project and open it.
    pub fn locate(start: impl AsRef<Path>) -> Result<Self> {
        match locate_config_dir(start.as_ref()) {
            LocatedConfig::Project(dir) => Self::open(dir),
            LocatedConfig::NeedsMigration { dir, version } => {
                Err(Error::IncompatibleSchemaVersion(format!(
                    "found a project at '{}' with schema version {version}; this build \
                     requires schema version {SCHEMA_VERSION}, run the migration first",
                    dir.display()
                )))
            }
            LocatedConfig::NotFound => Err(Error::Config(format!(
                "unable to find a project in or above '{}'",
                start.as_ref().display()
            ))),
        }
    }

    /// Resolve the job whose directory contains `path`.
    ///
    /// Scans the path for its last job-id-shaped component and locates the
    /// owning project above it. Returns the project together with the id;
    /// open the job with [`Project::open_job_by_id`].
    pub fn discover_job(path: impl AsRef<Path>) -> Result<(Self, JobId)> {
        let path = crate::config::absolute(path.as_ref());
        let mut job_dir: Option<PathBuf> = None;
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if let Some(name) = current.file_name().and_then(|n| n.to_str()) {
                if JobId::is_valid(name) {
                    job_dir = Some(current.clone());
                }
            }
        }
        let job_dir = job_dir.ok_or_else(|| {
            Error::JobNotFound(format!("no job id found in path '{}'", path.display()))
        })?;
        let id = JobId::parse(
            job_dir
                .file_name()
                .and_then(|n| n.to_str())
                .expect("job directory has a valid name"),
        )
        .expect("component was validated");
        let parent = job_dir.parent().unwrap_or(Path::new("/"));
        let project = Self::locate(parent)?;
        Ok((project, id))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Prepend a file name with the project path.
    pub fn fn_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.fn_path(name).is_file()
    }

    /// The project document handle.
    pub fn document(&self) -> SyncedJson {
        SyncedJson::dict(self.fn_path(FN_PROJECT_DOCUMENT))
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Open a job by state point. Never fails for a valid state point;
    /// the job is not initialized on disk until [`Job::init`].
    pub fn open_job(&self, statepoint: &Map<String, Value>) -> Result<Job<'_>> {
        self.read_cache_once();
        no_dot_in_key(&Value::Object(statepoint.clone()))?;
        let id = calc_id(statepoint);
        self.register(&id, statepoint.clone());
        Ok(Job::new(self, id))
    }

    /// Open a job by its id or a unique id prefix.
    ///
    /// Requires the job to be known: either present in the state point
    /// cache or initialized in the workspace.
    pub fn open_job_by_id(&self, id: &str) -> Result<Job<'_>> {
        self.read_cache_once();
        if id.len() >= JOB_ID_LENGTH {
            let id = JobId::parse(id).map_err(|err| Error::InvalidArgument(err.to_string()))?;
            let known = {
                let cache = self.lock_cache();
                cache.entries.contains_key(&id)
            };
            if known || self.contains_id(&id) {
                return Ok(Job::new(self, id));
            }
            return Err(Error::JobNotFound(id.to_string()));
        }
        // Resolve a partial id against the workspace.
        let matches: Vec<JobId> = self
            .job_ids()?
            .into_iter()
            .filter(|candidate| candidate.as_str().starts_with(id))
            .collect();
        match matches.len() {
            0 => Err(Error::JobNotFound(id.to_string())),
            1 => Ok(Job::new(self, matches.into_iter().next().expect("one match"))),
            _ => Err(Error::AmbiguousJobId(id.to_string())),
        }
    }

    /// Whether a job id is initialized in this workspace.
    pub fn contains_id(&self, id: &JobId) -> bool {
        self.workspace.join(id.as_str()).exists()
    }

    pub fn contains(&self, job: &Job<'_>) -> bool {
        self.contains_id(job.id())
    }

    /// The ids of all initialized jobs, sorted.
    pub fn job_ids(&self) -> Result<Vec<JobId>> {
        let entries = match fs::read_dir(&self.workspace) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if self.workspace.is_symlink() {
                    return Err(Error::Workspace(format!(
                        "the link '{}' pointing to the workspace is broken",
                        self.workspace.display()
                    )));
                }
                warn!(workspace = %self.workspace.display(), "workspace directory does not exist");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(Error::Workspace(format!(
                    "unable to access the workspace directory '{}': {err}",
                    self.workspace.display()
                )))
            }
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(&self.workspace, err))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = JobId::parse(name) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Number of initialized jobs.
    pub fn num_jobs(&self) -> Result<usize> {
        Ok(self.job_ids()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.num_jobs()? == 0)
    }

    /// A cursor over all jobs.
    pub fn jobs(&self) -> JobsCursor<'_> {
        JobsCursor::new(self, None)
    }

    /// A cursor over the jobs matching `filter`.
    ///
    /// Unprefixed filter keys query the state point namespace; `doc.`
    /// targets the job document.
    pub fn find_jobs(&self, filter: Map<String, Value>) -> JobsCursor<'_> {
        if filter.is_empty() {
            self.jobs()
        } else {
            JobsCursor::new(self, Some(filter))
        }
    }

    /// Like [`Project::find_jobs`], with the filter given in the compact
    /// token syntax, e.g. `"a 1 doc.ready true"`.
    pub fn find_jobs_from_str(&self, filter: &str) -> Result<JobsCursor<'_>> {
        Ok(self.find_jobs(signac_query::parse_str(filter)?))
    }

    pub(crate) fn find_job_ids(&self, filter: Option<&Map<String, Value>>) -> Result<Vec<JobId>> {
        let filter = match filter {
            None => return self.job_ids(),
            Some(filter) if filter.is_empty() => return self.job_ids(),
            Some(filter) => filter,
        };
        let prefixed = signac_query::add_prefix(filter)?;
        let include_doc = signac_query::root_keys(&prefixed).contains("doc");
        let index = self.build_index(include_doc)?;
        let mut ids = index
            .find(&Value::Object(prefixed))?
            .into_iter()
            .map(|id| JobId::parse(&id).map_err(|err| Error::InvalidArgument(err.to_string())))
            .collect::<Result<Vec<_>>>()?;
        ids.sort();
        Ok(ids)
    }

    /// Build a search index over the state points (and optionally the
    /// documents) of all jobs.
    pub fn build_index(&self, include_job_document: bool) -> Result<SearchIndex> {
        let mut index = SearchIndex::new();
        for id in self.job_ids()? {
            let mut doc = Map::new();
            doc.insert("sp".to_string(), Value::Object(self.statepoint_for(&id)?));
            if include_job_document {
                let path = self.workspace.join(id.as_str()).join(FN_DOCUMENT);
                match fs::read(&path) {
                    Ok(bytes) => {
                        let value: Value = serde_json::from_slice(&bytes)
                            .map_err(|err| Error::json(&path, err))?;
                        doc.insert("doc".to_string(), value);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(Error::io(&path, err)),
                }
            }
            index.insert(id.to_string(), Value::Object(doc));
        }
        Ok(index)
    }

    // ------------------------------------------------------------------
    // State point cache
    // ------------------------------------------------------------------

    pub(crate) fn register(&self, id: &JobId, statepoint: Map<String, Value>) {
        self.lock_cache().entries.insert(id.clone(), statepoint);
    }

    /// The state point for `id`, from the cache or read and verified from
    /// the workspace.
    pub(crate) fn statepoint_for(&self, id: &JobId) -> Result<Map<String, Value>> {
        self.read_cache_once();
        let threshold = self.config.cache_miss_warning_threshold();
        {
            let mut cache = self.lock_cache();
            if let Some(statepoint) = cache.entries.get(id) {
                return Ok(statepoint.clone());
            }
            cache.misses += 1;
            if !cache.warned && cache.misses > threshold {
                debug!(
                    misses = cache.misses,
                    "high number of state point cache misses; consider updating the \
                     persistent cache"
                );
                cache.warned = true;
            }
        }
        let statepoint = self.read_statepoint_file(id, true)?;
        self.register(id, statepoint.clone());
        Ok(statepoint)
    }

    /// Cache-or-disk lookup without hash verification, used by repair.
    fn statepoint_unchecked(&self, id: &JobId) -> Result<Map<String, Value>> {
        {
            let cache = self.lock_cache();
            if let Some(statepoint) = cache.entries.get(id) {
                return Ok(statepoint.clone());
            }
        }
        self.read_statepoint_file(id, false)
    }

    fn read_statepoint_file(&self, id: &JobId, validate: bool) -> Result<Map<String, Value>> {
        let job_dir = self.workspace.join(id.as_str());
        if validate {
            StatePointFile::new(&job_dir).load_verified(id)
        } else {
            let path = job_dir.join(FN_STATE_POINT);
            let bytes = fs::read(&path).map_err(|_| {
                if job_dir.is_dir() {
                    Error::JobsCorrupted(vec![id.clone()])
                } else {
                    Error::JobNotFound(id.to_string())
                }
            })?;
            serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|value| value.as_object().cloned())
                .ok_or_else(|| Error::JobsCorrupted(vec![id.clone()]))
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, StatePointCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_cache_once(&self) {
        {
            let cache = self.lock_cache();
            if cache.read_from_disk {
                return;
            }
        }
        match self.read_persistent_cache() {
            Ok(Some(entries)) => {
                let mut cache = self.lock_cache();
                cache.entries.extend(entries);
                cache.read_from_disk = true;
            }
            Ok(None) => {
                self.lock_cache().read_from_disk = true;
            }
            Err(err) => {
                warn!(%err, "failed to read the persistent state point cache");
                self.lock_cache().read_from_disk = true;
            }
        }
    }

    fn read_persistent_cache(&self) -> Result<Option<HashMap<JobId, Map<String, Value>>>> {
        let path = self.fn_path(FN_CACHE);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io(&path, err)),
        };
        let mut decoder = GzDecoder::new(file);
        let mut bytes = Vec::new();
        decoder
            .read_to_end(&mut bytes)
            .map_err(|err| Error::io(&path, err))?;
        let entries: HashMap<JobId, Map<String, Value>> =
            serde_json::from_slice(&bytes).map_err(|err| Error::json(&path, err))?;
        debug!(count = entries.len(), "read the persistent state point cache");
        Ok(Some(entries))
    }

    /// Refresh the in-memory cache from the workspace and persist it.
    ///
    /// State point reads are parallelized across a small fixed thread
    /// pool. Returns the number of cached state points.
    pub fn update_cache(&self) -> Result<usize> {
        info!("updating the state point cache");
        let persisted = self.read_persistent_cache()?;
        if let Some(entries) = &persisted {
            let mut cache = self.lock_cache();
            for (id, statepoint) in entries {
                cache.entries.entry(id.clone()).or_insert_with(|| statepoint.clone());
            }
            cache.read_from_disk = true;
        }

        let job_ids: HashSet<JobId> = self.job_ids()?.into_iter().collect();
        let (to_add, to_remove) = {
            let cache = self.lock_cache();
            let cached: HashSet<JobId> = cache.entries.keys().cloned().collect();
            (
                job_ids.difference(&cached).cloned().collect::<Vec<_>>(),
                cached.difference(&job_ids).cloned().collect::<Vec<_>>(),
            )
        };

        if !to_add.is_empty() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(CACHE_REFRESH_THREADS)
                .build()
                .map_err(|err| Error::InvalidArgument(err.to_string()))?;
            let loaded: Result<Vec<(JobId, Map<String, Value>)>> = pool.install(|| {
                use rayon::prelude::*;
                to_add
                    .par_iter()
                    .map(|id| Ok((id.clone(), self.read_statepoint_file(id, true)?)))
                    .collect()
            });
            let loaded = loaded?;
            let mut cache = self.lock_cache();
            cache.entries.extend(loaded);
        }
        {
            let mut cache = self.lock_cache();
            for id in &to_remove {
                cache.entries.remove(id);
            }
        }

        let entries = self.lock_cache().entries.clone();
        let changed = match persisted {
            Some(ref persisted) => {
                persisted.len() != entries.len()
                    || !persisted.keys().all(|id| entries.contains_key(id))
            }
            None => true,
        };
        if changed {
            let path = self.fn_path(FN_CACHE);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
            }
            let by_str: HashMap<&str, &Map<String, Value>> = entries
                .iter()
                .map(|(id, statepoint)| (id.as_str(), statepoint))
                .collect();
            let json = serde_json::to_vec(&by_str).map_err(|err| Error::json(&path, err))?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json).map_err(|err| Error::io(&path, err))?;
            let compressed = encoder.finish().map_err(|err| Error::io(&path, err))?;
            replace_file_atomic(&path, &compressed).map_err(|err| Error::io(&path, err))?;
            info!(count = entries.len(), "updated the persistent state point cache");
        } else {
            info!("the persistent state point cache is up to date");
        }
        Ok(entries.len())
    }

    /// Remove the persistent cache file, if present.
    pub fn remove_persistent_cache(&self) -> Result<()> {
        let path = self.fn_path(FN_CACHE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(&path, err)),
        }
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Check every job directory for state point corruption.
    pub fn check(&self) -> Result<()> {
        info!("checking the workspace for corruption");
        let mut corrupted = Vec::new();
        for id in self.job_ids()? {
            match self.read_statepoint_file(&id, true) {
                Ok(_) => {}
                Err(Error::JobsCorrupted(ids)) => corrupted.extend(ids),
                Err(err) => return Err(err),
            }
        }
        if corrupted.is_empty() {
            Ok(())
        } else {
            Err(Error::JobsCorrupted(corrupted))
        }
    }

    /// Attempt to repair corrupted or misplaced jobs.
    ///
    /// Jobs whose state point hashes to a different id are renamed to the
    /// correct directory; missing or invalid state point files are
    /// rewritten from the cache where possible.
    pub fn repair(&self, job_ids: Option<&[JobId]>) -> Result<()> {
        let ids = match job_ids {
            Some(ids) => ids.to_vec(),
            None => self.job_ids()?,
        };
        self.read_cache_once();
        let mut corrupted = Vec::new();
        for id in ids {
            let statepoint = match self.statepoint_unchecked(&id) {
                Ok(statepoint) => statepoint,
                Err(_) => {
                    warn!(job = %id, "unable to look up a state point for the job");
                    corrupted.push(id);
                    continue;
                }
            };
            let correct_id = calc_id(&statepoint);
            if correct_id != id {
                warn!(job = %id, correct = %correct_id, "job directory is misnamed");
                let invalid_dir = self.workspace.join(id.as_str());
                let correct_dir = self.workspace.join(correct_id.as_str());
                if let Err(err) = fs::rename(&invalid_dir, &correct_dir) {
                    warn!(%err, job = %id, "unable to fix the location of the job");
                    corrupted.push(id);
                    continue;
                }
                info!(job = %correct_id, "moved job to the correct directory");
            }
            let job = match self.open_job(&statepoint) {
                Ok(job) => job,
                Err(_) => {
                    corrupted.push(correct_id);
                    continue;
                }
            };
            if job.init(false).is_err() && job.init(true).is_err() {
                corrupted.push(correct_id);
            }
        }
        if corrupted.is_empty() {
            Ok(())
        } else {
            Err(Error::JobsCorrupted(corrupted))
        }
    }

    // ------------------------------------------------------------------
    // Schema, clone, sync, import/export
    // ------------------------------------------------------------------

    /// Detect the state point schema of the project (or a subset of its
    /// jobs).
    pub fn detect_schema(
        &self,
        exclude_const: bool,
        subset: Option<&[JobId]>,
    ) -> Result<ProjectSchema> {
        let ids = match subset {
            Some(subset) => {
                let known: HashSet<JobId> = self.job_ids()?.into_iter().collect();
                subset
                    .iter()
                    .filter(|id| known.contains(*id))
                    .cloned()
                    .collect()
            }
            None => self.job_ids()?,
        };
        let mut statepoints = Vec::with_capacity(ids.len());
        for id in &ids {
            statepoints.push(self.statepoint_for(id)?);
        }
        Ok(ProjectSchema::detect(&statepoints, exclude_const))
    }

    /// Copy a job from another project into this one.
    pub fn clone_job(&self, source: &Job<'_>) -> Result<Job<'_>> {
        let statepoint = source.statepoint()?;
        let destination = self.open_job(&statepoint)?;
        let src_dir = source.path();
        let dst_dir = destination.path();
        if dst_dir.exists() {
            return Err(Error::DestinationExists(destination.id().to_string()));
        }
        if !src_dir.is_dir() {
            return Err(Error::JobNotFound(source.id().to_string()));
        }
        sync::copy_dir_all(&src_dir, &dst_dir)?;
        debug!(job = %destination.id(), "cloned job");
        Ok(destination)
    }

    /// One-way merge of `source` into this project. See [`crate::sync`].
    pub fn sync_from(&self, source: &Project, options: &mut SyncOptions) -> Result<()> {
        sync::sync_projects(source, self, options)
    }

    /// Export all jobs to a directory or archive. See [`crate::export`].
    pub fn export_jobs(
        &self,
        target: impl AsRef<Path>,
        path_spec: ExportPath,
    ) -> Result<Vec<(PathBuf, String)>> {
        let cursor = self.jobs();
        let jobs: Vec<Job<'_>> = cursor.iter()?.collect();
        export::export_jobs(&jobs, target.as_ref(), path_spec)
    }

    /// Import a data space from a directory or archive. See
    /// [`crate::export`].
    pub fn import_jobs(
        &self,
        origin: impl AsRef<Path>,
        schema: Option<&str>,
    ) -> Result<Vec<(PathBuf, JobId)>> {
        export::import_into_project(self, origin.as_ref(), schema)
    }

    /// Create or update a linked view of the workspace under `prefix`.
    /// See [`crate::view`].
    pub fn create_linked_view(
        &self,
        prefix: impl AsRef<Path>,
        job_ids: Option<&[JobId]>,
    ) -> Result<Vec<(PathBuf, PathBuf)>> {
        crate::view::create_linked_view(self, prefix.as_ref(), job_ids)
    }

    /// The minimum id prefix length that uniquely identifies every job.
    pub fn min_len_unique_id(&self) -> Result<usize> {
        let ids = self.job_ids()?;
        let mut seen = HashSet::new();
        for length in 1..=JOB_ID_LENGTH {
            seen.clear();
            if ids.iter().all(|id| seen.insert(&id.as_str()[..length])) {
                return Ok(length);
            }
        }
        Ok(JOB_ID_LENGTH)
    }

    /// Create a temporary project, removed when the handle drops.
    ///
    /// By default the project is created inside this project's workspace
    /// so that both share one filesystem.
    pub fn temporary_project(&self) -> Result<TemporaryProject> {
        fs::create_dir_all(&self.workspace).map_err(|err| Error::io(&self.workspace, err))?;
        TemporaryProject::new_in(&self.workspace)
    }
}

fn check_schema_compatibility(config: &ProjectConfig) -> Result<()> {
    let version = config.schema_version();
    if version > SCHEMA_VERSION {
        Err(Error::IncompatibleSchemaVersion(format!(
            "the project uses schema version {version}, but this build only supports up \
             to schema version {SCHEMA_VERSION}"
        )))
    } else if version < SCHEMA_VERSION {
        Err(Error::IncompatibleSchemaVersion(format!(
            "the project uses schema version {version}, but this build requires schema \
             version {SCHEMA_VERSION}; run the migration to update it"
        )))
    } else {
        Ok(())
    }
}

/// A project in a temporary directory, removed on drop.
pub struct TemporaryProject {
    project: Project,
    _dir: tempfile::TempDir,
}

impl TemporaryProject {
    /// Create a temporary project in the system temporary directory.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|err| Error::io(std::env::temp_dir(), err))?;
        let project = Project::init(dir.path())?;
        Ok(Self { project, _dir: dir })
    }

    /// Create a temporary project inside `parent`.
    pub fn new_in(parent: &Path) -> Result<Self> {
        let dir = tempfile::tempdir_in(parent).map_err(|err| Error::io(parent, err))?;
        let project = Project::init(dir.path())?;
        Ok(Self { project, _dir: dir })
    }
}

impl Deref for TemporaryProject {
    type Target = Project;

    fn deref(&self) -> &Project {
        &self.project
    }
}
