//! Human-browsable linked views of the workspace.
//!
//! A linked view expands the data space into a directory tree whose paths
//! are built from state point keys, with a `job` symlink at each leaf
//! pointing back into the workspace. Unlike an export, a view is *updated*
//! in place: stale links from previous invocations are removed.

use crate::error::{Error, Result};
use crate::export::{auto_view_path, variable_statepoint_keys};
use crate::job::Job;
use crate::project::Project;
use signac_ids::JobId;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const LINK_NAME: &str = "job";

/// Create or update a linked view of the project under `prefix`.
///
/// Returns pairs of workspace directory and view link path. Restricting
/// `job_ids` limits the view to those jobs; links for jobs no longer part
/// of the selection are removed.
pub fn create_linked_view(
    project: &Project,
    prefix: &Path,
    job_ids: Option<&[JobId]>,
) -> Result<Vec<(PathBuf, PathBuf)>> {
    let ids = match job_ids {
        Some(ids) => ids.to_vec(),
        None => project.job_ids()?,
    };
    let jobs: Vec<Job<'_>> = ids.into_iter().map(|id| Job::new(project, id)).collect();

    let variable_keys = variable_statepoint_keys(&jobs)?;
    let mut mapping = Vec::with_capacity(jobs.len());
    let mut seen: HashSet<PathBuf> = HashSet::new();
    for job in &jobs {
        let rel = auto_view_path(job, &variable_keys)?;
        let link_dir = prefix.join(&rel);
        if !seen.insert(link_dir.clone()) {
            return Err(Error::InvalidArgument(format!(
                "view path '{rel}' is not unique; the state point schema does not \
                 distinguish every job"
            )));
        }
        mapping.push((job.path(), link_dir.join(LINK_NAME)));
    }

    // Remove links left over from previous invocations before creating the
    // new set, so moved jobs do not collide with their old locations.
    let wanted: HashSet<&PathBuf> = mapping.iter().map(|(_, link)| link).collect();
    prune_stale_links(prefix, &wanted)?;

    for (target, link) in &mapping {
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
        }
        match fs::symlink_metadata(link) {
            Ok(_) => {
                // An existing link is only reused if it already points at
                // the right target.
                if fs::read_link(link).map(|t| &t == target).unwrap_or(false) {
                    continue;
                }
                fs::remove_file(link).map_err(|err| Error::io(link, err))?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::io(link, err)),
        }
        symlink_dir(target, link)?;
        debug!(link = %link.display(), target = %target.display(), "linked job");
    }
    info!(count = mapping.len(), prefix = %prefix.display(), "updated linked view");
    Ok(mapping)
}

fn prune_stale_links(prefix: &Path, wanted: &HashSet<&PathBuf>) -> Result<()> {
    if !prefix.is_dir() {
        return Ok(());
    }
    let mut empty_candidates = Vec::new();
    for entry in WalkDir::new(prefix).contents_first(true) {
        let entry = entry.map_err(|err| {
            Error::Workspace(format!("failed to walk '{}': {err}", prefix.display()))
        })?;
        let path = entry.path();
        if entry.path_is_symlink() && entry.file_name() == LINK_NAME {
            if !wanted.contains(&path.to_path_buf()) {
                fs::remove_file(path).map_err(|err| Error::io(path, err))?;
                debug!(link = %path.display(), "removed stale view link");
            }
        } else if entry.file_type().is_dir() && path != prefix {
            empty_candidates.push(path.to_path_buf());
        }
    }
    // Directories emptied by link removal are pruned bottom-up.
    for dir in empty_candidates {
        let is_empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            fs::remove_dir(&dir).map_err(|err| Error::io(&dir, err))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|err| Error::io(link, err))
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_dir(target, link).map_err(|err| Error::io(link, err))
}
