//! State point files and the directory-rename protocol.
//!
//! A state point file never loads implicitly: it is either seeded from the
//! project cache or loaded explicitly and verified against the job id.
//! Replacing a state point computes the new id and atomically renames the
//! job directory when the id changes.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use signac_ids::{calc_id, JobId};
use signac_synced::replace_file_atomic;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// File name of the state point inside each job directory.
pub const FN_STATE_POINT: &str = "signac_statepoint.json";

/// Handle on the state point file of one job directory.
#[derive(Debug, Clone)]
pub struct StatePointFile {
    path: PathBuf,
}

impl StatePointFile {
    pub fn new(job_dir: &Path) -> Self {
        Self {
            path: job_dir.join(FN_STATE_POINT),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the state point and verify that it hashes to `id`.
    ///
    /// A missing file, unparseable contents, a non-object root, or a hash
    /// mismatch all mean the job is corrupted.
    pub fn load_verified(&self, id: &JobId) -> Result<Map<String, Value>> {
        let corrupted = || Error::JobsCorrupted(vec![id.clone()]);
        let bytes = fs::read(&self.path).map_err(|_| corrupted())?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|_| corrupted())?;
        let statepoint = match value {
            Value::Object(map) => map,
            _ => return Err(corrupted()),
        };
        if &calc_id(&statepoint) != id {
            return Err(corrupted());
        }
        Ok(statepoint)
    }

    /// Write the state point unless the file already exists.
    ///
    /// With `force`, an existing file is overwritten, e.g. to repair a
    /// corrupted workspace. On a failed write the partial file is removed
    /// so a corrupt file is never left behind.
    pub fn save(&self, statepoint: &Map<String, Value>, force: bool) -> Result<()> {
        if !force && self.exists() {
            return Ok(());
        }
        let bytes = serde_json::to_vec(&Value::Object(statepoint.clone()))
            .map_err(|err| Error::json(&self.path, err))?;
        if let Err(err) = replace_file_atomic(&self.path, &bytes) {
            let _ = fs::remove_file(&self.path);
            return Err(Error::io(&self.path, err));
        }
        Ok(())
    }
}

/// Replace the state point of the job `old_id`, renaming its directory to
/// the new id.
///
/// The state point file is first moved aside as a backup so a failed
/// directory rename can be rolled back. An uninitialized job (no directory
/// on disk) only changes ids in memory. Returns the new id.
pub(crate) fn rename_for_new_statepoint(
    workspace: &Path,
    old_id: &JobId,
    new_statepoint: &Map<String, Value>,
) -> Result<JobId> {
    let new_id = calc_id(new_statepoint);
    let old_dir = workspace.join(old_id.as_str());
    let new_dir = workspace.join(new_id.as_str());
    if new_id == *old_id {
        return Ok(new_id);
    }

    let sp_file = old_dir.join(FN_STATE_POINT);
    let backup = old_dir.join(format!("{FN_STATE_POINT}~"));
    match fs::rename(&sp_file, &backup) {
        Ok(()) => {
            if let Err(err) = fs::rename(&old_dir, &new_dir) {
                // Roll the state point file back before reporting.
                if let Err(rollback) = fs::rename(&backup, &sp_file) {
                    error!(%rollback, job = %old_id, "failed to restore the state point file");
                }
                return Err(rename_error(err, &new_id));
            }
            // The backup travelled with the directory.
            let moved_backup = new_dir.join(format!("{FN_STATE_POINT}~"));
            if let Err(err) = fs::remove_file(&moved_backup) {
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(Error::io(&moved_backup, err));
                }
            }
            StatePointFile::new(&new_dir).save(new_statepoint, true)?;
            info!(from = %old_id, to = %new_id, "moved job directory");
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // The job was never initialized; only the in-memory id moves.
        }
        Err(err) => return Err(Error::io(&sp_file, err)),
    }
    Ok(new_id)
}

pub(crate) fn rename_error(err: io::Error, new_id: &JobId) -> Error {
    match err.kind() {
        io::ErrorKind::AlreadyExists
        | io::ErrorKind::DirectoryNotEmpty
        | io::ErrorKind::PermissionDenied => Error::DestinationExists(new_id.to_string()),
        io::ErrorKind::CrossesDevices => Error::CrossDevice,
        _ => Error::Io {
            path: PathBuf::from(new_id.as_str()),
            source: err,
        },
    }
}
