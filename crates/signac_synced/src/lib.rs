//! File-backed synced JSON collections.
//!
//! A [`SyncedJson`] mirrors a single JSON file: reads refresh from the file
//! (or the process-wide buffer when buffering is active) and every mutation
//! validates, updates the in-memory value, and writes back. Writes replace
//! the target atomically through a sibling temporary file, so a crash never
//! leaves a partially written document behind.
//!
//! The [`buffer`] module provides the deferred write-back mode: inside a
//! `buffered` region, saves accumulate in a capacity-bounded in-memory
//! buffer and are written out on exit, with integrity checks against
//! concurrent external modification.

pub mod buffer;
mod document;
mod validate;

pub use buffer::{buffered, BufferError, BufferGuard, BufferedFileError};
pub use document::SyncedJson;
pub use validate::{no_dot_in_key, Validator};

use once_cell::sync::Lazy;
use parking_lot::ReentrantMutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by synced collections.
#[derive(Debug, Error)]
pub enum SyncedError {
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

    /// A mapping key contains a dot, which is reserved for nested-key
    /// addressing in queries.
    #[error("mapping keys may not contain dots ('.'): '{key}'")]
    InvalidKey { key: String },

    #[error("'{path}' does not hold a JSON object")]
    NotAMapping { path: PathBuf },

    #[error("'{path}' does not hold a JSON array")]
    NotASequence { path: PathBuf },

    #[error("index {index} out of bounds for sequence of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Result type for synced collection operations.
pub type Result<T> = std::result::Result<T, SyncedError>;

// One reentrant lock per canonical file path. All collections pointing to
// the same file share the lock, so read-modify-write regions across
// instances and threads serialize.
static RESOURCE_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<ReentrantMutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn resource_lock(path: &Path) -> Arc<ReentrantMutex<()>> {
    let mut locks = RESOURCE_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
        .clone()
}

/// Write `bytes` to `path` by writing a sibling temporary file and renaming
/// it over the target. The rename is atomic at the filesystem level.
///
/// The temporary file is named `._<uuid>_<name>` next to the target and is
/// removed if the rename fails.
pub fn replace_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = dir
        .unwrap_or_else(|| Path::new("."))
        .join(format!("._{}_{}", Uuid::new_v4(), name.to_string_lossy()));
    std::fs::write(&tmp, bytes)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = std::fs::remove_file(&tmp);
            Err(err)
        }
    }
}

pub(crate) fn io_err(path: &Path, source: io::Error) -> SyncedError {
    SyncedError::Io {
        path: path.to_path_buf(),
        source,
    }
}
