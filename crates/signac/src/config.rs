//! Project configuration files.
//!
//! The configuration lives at `<project>/.signac/config` as plain
//! `key = value` lines. The only required key is `schema_version`; unknown
//! keys round-trip through load and write unchanged.

use crate::error::{Error, Result};
use crate::migrate::{detect_schema_version, SCHEMA_VERSION};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Relative path of the project configuration file.
pub const PROJECT_CONFIG_FN: &str = ".signac/config";

/// Marker file of the previous on-disk schema generation.
pub const V1_CONFIG_FN: &str = "signac.rc";

/// Default number of state point cache misses tolerated before a warning
/// suggests persisting the cache.
pub const DEFAULT_CACHE_MISS_WARNING_THRESHOLD: usize = 500;

/// Parsed project configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    schema_version: u32,
    extra: BTreeMap<String, String>,
}

impl ProjectConfig {
    /// A minimal configuration at the current schema version.
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            extra: BTreeMap::new(),
        }
    }

    /// Load the configuration of the project at `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(PROJECT_CONFIG_FN);
        let contents = fs::read_to_string(&path).map_err(|err| {
            Error::Config(format!(
                "failed to read configuration file '{}': {err}",
                path.display()
            ))
        })?;
        Self::parse(&contents, &path)
    }

    pub(crate) fn parse(contents: &str, path: &Path) -> Result<Self> {
        let mut entries = parse_key_values(contents, path)?;
        let schema_version = match entries.remove("schema_version") {
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                Error::Config(format!(
                    "invalid schema_version '{raw}' in '{}'",
                    path.display()
                ))
            })?,
            None => {
                return Err(Error::Config(format!(
                    "missing required key 'schema_version' in '{}'",
                    path.display()
                )))
            }
        };
        Ok(Self {
            schema_version,
            extra: entries,
        })
    }

    /// Write the configuration into `<dir>/.signac/config`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(PROJECT_CONFIG_FN);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
        }
        let mut out = format!("schema_version = {}\n", self.schema_version);
        for (key, value) in &self.extra {
            out.push_str(&format!("{key} = {value}\n"));
        }
        fs::write(&path, out).map_err(|err| Error::io(&path, err))?;
        debug!(path = %path.display(), "wrote project configuration");
        Ok(())
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub(crate) fn set_schema_version(&mut self, version: u32) {
        self.schema_version = version;
    }

    /// Look up a non-required configuration value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(key.into(), value.into());
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<String> {
        self.extra.remove(key)
    }

    /// The configured state point cache miss warning threshold.
    pub fn cache_miss_warning_threshold(&self) -> usize {
        self.get("statepoint_cache_miss_warning_threshold")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_CACHE_MISS_WARNING_THRESHOLD)
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `key = value` lines, ignoring blank lines and `#` comments.
pub(crate) fn parse_key_values(
    contents: &str,
    path: &Path,
) -> Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::Config(format!(
                "malformed line {} in '{}': '{line}'",
                lineno + 1,
                path.display()
            ))
        })?;
        entries.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(entries)
}

/// Result of an upward configuration search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatedConfig {
    /// A project configuration was found at the contained directory.
    Project(PathBuf),
    /// Only an older-schema marker was found; the project must be migrated
    /// before it can be opened.
    NeedsMigration { dir: PathBuf, version: u32 },
    /// No configuration exists between the start directory and the root.
    NotFound,
}

/// Walk from `start` toward the filesystem root looking for a project
/// configuration. Older-schema projects are reported separately so callers
/// can refuse to open them or invoke the migrator.
pub fn locate_config_dir(start: &Path) -> LocatedConfig {
    let start = absolute(start);
    let mut current = Some(start.as_path());
    while let Some(dir) = current {
        if dir.join(PROJECT_CONFIG_FN).is_file() {
            return LocatedConfig::Project(dir.to_path_buf());
        }
        current = dir.parent();
    }

    debug!(start = %start.display(), "no config found, checking for older schemas");
    let mut current = Some(start.as_path());
    while let Some(dir) = current {
        if dir.join(V1_CONFIG_FN).is_file() {
            if let Ok(version) = detect_schema_version(dir) {
                if version < SCHEMA_VERSION {
                    return LocatedConfig::NeedsMigration {
                        dir: dir.to_path_buf(),
                        version,
                    };
                }
            }
        }
        current = dir.parent();
    }
    LocatedConfig::NotFound
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Raise when the directory carries an older-schema marker.
pub(crate) fn refuse_older_schema(dir: &Path) -> Result<()> {
    if dir.join(V1_CONFIG_FN).is_file() {
        if let Ok(version) = detect_schema_version(dir) {
            if version < SCHEMA_VERSION {
                return Err(Error::IncompatibleSchemaVersion(format!(
                    "the project at '{}' uses schema version {version}, but this build \
                     requires schema version {SCHEMA_VERSION}; run the migration first",
                    dir.display()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::new();
        config.set("statepoint_cache_miss_warning_threshold", "10");
        config.write(dir.path()).unwrap();

        let loaded = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.schema_version(), SCHEMA_VERSION);
        assert_eq!(loaded.cache_miss_warning_threshold(), 10);
    }

    #[test]
    fn missing_schema_version_is_a_config_error() {
        let err = ProjectConfig::parse("a = b\n", Path::new("config")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let config = ProjectConfig::parse(
            "# a comment\n\nschema_version = 2\nname = test\n",
            Path::new("config"),
        )
        .unwrap();
        assert_eq!(config.schema_version(), 2);
        assert_eq!(config.get("name"), Some("test"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(ProjectConfig::parse("schema_version\n", Path::new("config")).is_err());
    }

    #[test]
    fn locate_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        ProjectConfig::new().write(dir.path()).unwrap();
        let nested = dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(
            locate_config_dir(&nested),
            LocatedConfig::Project(dir.path().to_path_buf())
        );
    }

    #[test]
    fn locate_reports_older_schemas() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(V1_CONFIG_FN), "schema_version = 1\n").unwrap();
        match locate_config_dir(dir.path()) {
            LocatedConfig::NeedsMigration { dir: found, version } => {
                assert_eq!(found, dir.path());
                assert_eq!(version, 1);
            }
            other => panic!("expected NeedsMigration, got {other:?}"),
        }
    }
}
