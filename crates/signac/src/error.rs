//! Error types for workspace and project operations.

use signac_ids::JobId;
use signac_query::QueryError;
use signac_synced::{BufferError, SyncedError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for project operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Project-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Unreadable or malformed configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The on-disk schema is newer than this build supports, or older and
    /// migration was refused.
    #[error("{0}")]
    IncompatibleSchemaVersion(String),

    /// A rename would clobber an existing job directory.
    #[error("destination '{0}' already exists")]
    DestinationExists(String),

    /// One or more jobs failed their state point integrity check.
    #[error("the state point of the following job(s) is corrupted or missing: {}", fmt_ids(.0))]
    JobsCorrupted(Vec<JobId>),

    /// The workspace directory is missing, inaccessible, or a broken
    /// symlink.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// A referenced job cannot be produced from the cache or workspace.
    #[error("job '{0}' is not initialized in this project")]
    JobNotFound(String),

    #[error("job id prefix '{0}' matches more than one job")]
    AmbiguousJobId(String),

    #[error("cannot move jobs across devices (file systems)")]
    CrossDevice,

    /// A file differs between source and destination and no strategy
    /// resolved it.
    #[error("the file '{}' caused a synchronization conflict", .0.display())]
    FileSyncConflict(PathBuf),

    /// Document keys conflicted and no strategy covered them.
    #[error("the following key(s) caused a synchronization conflict: {}", .0.join(", "))]
    DocumentSyncConflict(Vec<String>),

    /// Source and destination state point schemas differ.
    #[error("synchronization failed because the project schemas differ")]
    SchemaSyncConflict,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Synced(#[from] SyncedError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("I/O error accessing '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

fn fmt_ids(ids: &[JobId]) -> String {
    ids.iter()
        .map(JobId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
