//! Schema migrations between on-disk project layouts.
//!
//! Migrations form a chain keyed by `(from, to)` version pairs and run
//! under an advisory file lock, so concurrent openers of the same project
//! on a shared filesystem cannot interleave migration steps. Each step
//! persists the new schema version before the next one is considered; a
//! failing step leaves the project at the last persisted version.

use crate::config::{parse_key_values, ProjectConfig, V1_CONFIG_FN};
use crate::error::{Error, Result};
use crate::project::FN_PROJECT_DOCUMENT;
use fs2::FileExt;
use serde_json::json;
use signac_synced::SyncedJson;
use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

/// Name of the migration lock file, created at the project root.
pub const FN_MIGRATION_LOCK: &str = ".SIGNAC_PROJECT_MIGRATION_LOCK";

/// Location of the persistent state point cache under the v1 schema.
const V1_CACHE_FN: &str = ".signac_sp_cache.json.gz";

/// Reserved project document key receiving a demoted v1 project name.
pub const KEY_PROJECT_NAME: &str = "signac_project_name";

/// Detect the schema version of the project at `dir` by trying the
/// per-version configuration loaders in descending order.
pub fn detect_schema_version(dir: &Path) -> Result<u32> {
    if dir.join(crate::config::PROJECT_CONFIG_FN).is_file() {
        return Ok(ProjectConfig::load(dir)?.schema_version());
    }
    if dir.join(V1_CONFIG_FN).is_file() {
        return Ok(V1Config::load(dir)?.schema_version);
    }
    Err(Error::Config(format!(
        "unable to determine the schema version of '{}': no configuration found",
        dir.display()
    )))
}

/// Configuration of the previous schema generation: `signac.rc` at the
/// project root with optional `project` and `workspace_dir` keys.
#[derive(Debug)]
struct V1Config {
    schema_version: u32,
    project: Option<String>,
    workspace_dir: Option<String>,
    extra: BTreeMap<String, String>,
}

impl V1Config {
    fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(V1_CONFIG_FN);
        let contents = fs::read_to_string(&path).map_err(|err| {
            Error::Config(format!(
                "failed to read configuration file '{}': {err}",
                path.display()
            ))
        })?;
        let mut entries = parse_key_values(&contents, &path)?;
        let schema_version = match entries.remove("schema_version") {
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                Error::Config(format!(
                    "invalid schema_version '{raw}' in '{}'",
                    path.display()
                ))
            })?,
            None => 1,
        };
        Ok(Self {
            schema_version,
            project: entries.remove("project"),
            workspace_dir: entries.remove("workspace_dir"),
            extra: entries,
        })
    }
}

/// Apply all pending migrations to the project at `dir`.
///
/// Returns the `(from, to)` pairs that were applied, in order. The
/// migration lock is held for the whole run and the lock file is removed
/// afterwards.
pub fn apply_migrations(dir: &Path) -> Result<Vec<(u32, u32)>> {
    let _lock = MigrationLock::acquire(dir)?;
    let mut applied = Vec::new();
    loop {
        let current = detect_schema_version(dir)?;
        if current == SCHEMA_VERSION {
            break;
        }
        if current > SCHEMA_VERSION {
            return Err(Error::IncompatibleSchemaVersion(format!(
                "the project at '{}' uses schema version {current}, but this build only \
                 supports up to schema version {SCHEMA_VERSION}",
                dir.display()
            )));
        }
        match current {
            1 => {
                info!(dir = %dir.display(), "applying migration for schema version 1 -> 2");
                migrate_v1_to_v2(dir)?;
                applied.push((1, 2));
            }
            other => {
                return Err(Error::Config(format!(
                    "no migration path from schema version {other}"
                )))
            }
        }
    }
    Ok(applied)
}

/// Migrate from schema version 1 to 2.
///
/// Moves `signac.rc` into `.signac/config`, relocates the persistent state
/// point cache, renames a configured non-default workspace directory to
/// `workspace` (the only allowed name from version 2 on), and demotes a
/// custom project name into the project document.
fn migrate_v1_to_v2(dir: &Path) -> Result<()> {
    let v1 = V1Config::load(dir)?;

    if let Some(ws_name) = v1.workspace_dir.as_deref() {
        if ws_name != "workspace" {
            let src = dir.join(ws_name);
            let dst = dir.join("workspace");
            if dst.exists() {
                return Err(Error::DestinationExists(dst.display().to_string()));
            }
            if src.is_dir() {
                fs::rename(&src, &dst).map_err(|err| Error::io(&src, err))?;
                info!(from = %src.display(), to = %dst.display(), "renamed workspace directory");
            }
        }
    }

    let old_cache = dir.join(V1_CACHE_FN);
    if old_cache.is_file() {
        let new_cache = dir.join(crate::project::FN_CACHE);
        if let Some(parent) = new_cache.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
        }
        fs::rename(&old_cache, &new_cache).map_err(|err| Error::io(&old_cache, err))?;
        info!(to = %new_cache.display(), "relocated state point cache");
    }

    if let Some(name) = v1.project {
        let mut document = SyncedJson::dict(dir.join(FN_PROJECT_DOCUMENT));
        document.insert(KEY_PROJECT_NAME, json!(name))?;
        info!(name, "recorded project name in the project document");
    }

    let mut config = ProjectConfig::new();
    for (key, value) in v1.extra {
        config.set(key, value);
    }
    config.set_schema_version(SCHEMA_VERSION);
    config.write(dir)?;

    let rc = dir.join(V1_CONFIG_FN);
    fs::remove_file(&rc).map_err(|err| Error::io(&rc, err))?;
    Ok(())
}

/// Advisory exclusive lock held for the duration of a migration run.
struct MigrationLock {
    file: File,
    path: PathBuf,
}

impl MigrationLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(FN_MIGRATION_LOCK);
        let file = File::create(&path).map_err(|err| Error::io(&path, err))?;
        file.lock_exclusive().map_err(|err| Error::io(&path, err))?;
        Ok(Self { file, path })
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(%err, "failed to release the migration lock");
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, "failed to remove the migration lock file");
            }
        }
    }
}
