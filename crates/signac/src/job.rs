//! Job handles.
//!
//! A [`Job`] is a lightweight handle on one workspace entry: a non-owning
//! reference to its project plus the job id. All persistent state lives in
//! the workspace and the project's state point cache, so handles are cheap
//! to create and copy; cursors yield freshly constructed handles.

use crate::error::{Error, Result};
use crate::project::Project;
use crate::statepoint::{rename_error, rename_for_new_statepoint, StatePointFile, FN_STATE_POINT};
use crate::sync::{self, SyncOptions};
use serde_json::{Map, Value};
use signac_ids::JobId;
use signac_synced::{no_dot_in_key, SyncedJson};
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the job document inside each job directory.
pub const FN_DOCUMENT: &str = "signac_job_document.json";

/// A handle on the data of one state point.
///
/// Jobs are obtained from [`Project::open_job`] or
/// [`Project::open_job_by_id`]; a job exists in memory first and is
/// *initialized* once its directory and state point file are materialized
/// via [`Job::init`].
#[derive(Clone)]
pub struct Job<'a> {
    project: &'a Project,
    id: JobId,
}

impl<'a> Job<'a> {
    pub(crate) fn new(project: &'a Project, id: JobId) -> Self {
        Self { project, id }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn project(&self) -> &'a Project {
        self.project
    }

    /// The job directory path. The directory may not exist yet.
    pub fn path(&self) -> PathBuf {
        self.project.workspace().join(self.id.as_str())
    }

    pub fn statepoint_path(&self) -> PathBuf {
        self.path().join(FN_STATE_POINT)
    }

    pub fn document_path(&self) -> PathBuf {
        self.path().join(FN_DOCUMENT)
    }

    /// The job's state point, from the cache or verified from disk.
    pub fn statepoint(&self) -> Result<Map<String, Value>> {
        self.project.statepoint_for(&self.id)
    }

    /// Prepend a file name with the job directory.
    pub fn fn_path(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    /// Check whether a file exists in the job directory.
    pub fn has_file(&self, name: &str) -> bool {
        self.fn_path(name).is_file()
    }

    /// Whether the directory and a state point file exist on disk.
    pub fn is_initialized(&self) -> bool {
        self.statepoint_path().is_file()
    }

    /// Initialize the job directory.
    ///
    /// Idempotent: an existing valid state point file is verified and left
    /// alone. With `force`, the state point file is rewritten from the
    /// cached state point, e.g. to repair corruption.
    pub fn init(&self, force: bool) -> Result<()> {
        let file = StatePointFile::new(&self.path());
        if !force && file.exists() {
            let statepoint = file.load_verified(&self.id)?;
            self.project.register(&self.id, statepoint);
            return Ok(());
        }
        let statepoint = self.project.statepoint_for(&self.id)?;
        let dir = self.path();
        fs::create_dir_all(&dir).map_err(|err| Error::io(&dir, err))?;
        file.save(&statepoint, force)?;
        let verified = file.load_verified(&self.id)?;
        self.project.register(&self.id, verified);
        debug!(job = %self.id, "initialized job directory");
        Ok(())
    }

    /// Ensure the directory exists without validating the state point.
    pub(crate) fn ensure_directory(&self) -> Result<()> {
        if self.path().is_dir() {
            Ok(())
        } else {
            self.init(false)
        }
    }

    /// The job document handle. Initializes the directory on first use.
    pub fn document(&self) -> Result<SyncedJson> {
        self.ensure_directory()?;
        Ok(SyncedJson::dict(self.document_path()))
    }

    /// Remove all files inside the job directory except the state point
    /// and the document, and empty the document. Does nothing for an
    /// uninitialized job.
    pub fn clear(&self) -> Result<()> {
        let dir = self.path();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(Error::io(&dir, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(&dir, err))?;
            let name = entry.file_name();
            if name == FN_STATE_POINT || name == FN_DOCUMENT {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|err| Error::io(&path, err))?;
        }
        let mut document = SyncedJson::dict(self.document_path());
        document.clear()?;
        Ok(())
    }

    /// `clear` then `init`: reset the job to a freshly initialized state.
    pub fn reset(&self) -> Result<()> {
        self.clear()?;
        self.init(false)
    }

    /// Recursively delete the job directory. Does nothing if the
    /// directory does not exist.
    pub fn remove(&self) -> Result<()> {
        let dir = self.path();
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(job = %self.id, "removed job");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(&dir, err)),
        }
    }

    /// Move this job into another project's workspace.
    ///
    /// The rename stays on one device; a job with the same id in the
    /// destination refuses the move.
    pub fn move_to<'b>(&self, destination: &'b Project) -> Result<Job<'b>> {
        let statepoint = self.statepoint()?;
        let dst_job = destination.open_job(&statepoint)?;
        let ws = destination.workspace();
        fs::create_dir_all(ws).map_err(|err| Error::io(ws, err))?;
        match fs::rename(self.path(), dst_job.path()) {
            Ok(()) => {
                info!(job = %self.id, to = %destination.path().display(), "moved job");
                Ok(dst_job)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::JobNotFound(self.id.to_string()))
            }
            Err(err) => Err(rename_error(err, &dst_job.id)),
        }
    }

    /// Replace the state point, renaming the job directory when the id
    /// changes. Returns the handle with the new id.
    pub fn reset_statepoint(&self, new_statepoint: Map<String, Value>) -> Result<Job<'a>> {
        no_dot_in_key(&Value::Object(new_statepoint.clone()))?;
        let new_id = rename_for_new_statepoint(
            self.project.workspace(),
            &self.id,
            &new_statepoint,
        )?;
        self.project.register(&new_id, new_statepoint);
        Ok(Job::new(self.project, new_id))
    }

    /// Merge keys into the state point, preserving job data.
    ///
    /// Without `overwrite`, an update that would change the value of an
    /// existing key is refused.
    pub fn update_statepoint(
        &self,
        update: Map<String, Value>,
        overwrite: bool,
    ) -> Result<Job<'a>> {
        let mut statepoint = self.statepoint()?;
        if !overwrite {
            for (key, value) in &update {
                if let Some(existing) = statepoint.get(key) {
                    if existing != value {
                        return Err(Error::InvalidArgument(format!(
                            "key '{key}' already exists in the state point with another value"
                        )));
                    }
                }
            }
        }
        for (key, value) in update {
            statepoint.insert(key, value);
        }
        self.reset_statepoint(statepoint)
    }

    /// Synchronize this job from another job. See [`crate::sync`].
    pub fn sync_from(&self, source: &Job<'_>, options: &mut SyncOptions) -> Result<()> {
        sync::sync_jobs(source, self, options)
    }

    /// Change into the job directory, initializing it if necessary.
    ///
    /// The returned guard restores the previous working directory when
    /// dropped, on all exit paths.
    pub fn enter(&self) -> Result<WorkdirGuard> {
        let previous = std::env::current_dir()
            .map_err(|err| Error::io(Path::new("."), err))?;
        self.ensure_directory()?;
        let dir = self.path();
        std::env::set_current_dir(&dir).map_err(|err| Error::io(&dir, err))?;
        debug!(dir = %dir.display(), "entered job directory");
        Ok(WorkdirGuard { previous })
    }
}

impl PartialEq for Job<'_> {
    fn eq(&self, other: &Self) -> bool {
        let canonical = |job: &Job<'_>| {
            let path = job.path();
            fs::canonicalize(&path).unwrap_or(path)
        };
        self.id == other.id && canonical(self) == canonical(other)
    }
}

impl Eq for Job<'_> {}

impl Hash for Job<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Job<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Job<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("project", &self.project.path())
            .finish()
    }
}

/// Restores the working directory recorded at [`Job::enter`] when dropped.
pub struct WorkdirGuard {
    previous: PathBuf,
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if let Err(err) = std::env::set_current_dir(&self.previous) {
            warn!(%err, dir = %self.previous.display(), "failed to restore the working directory");
        }
    }
}
