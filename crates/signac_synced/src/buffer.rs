//! Process-wide serialized write-back buffer.
//!
//! Inside a buffered region (see [`buffered`]), synced collections write
//! their serialized contents into a single in-memory buffer instead of the
//! filesystem. On exit the buffer flushes every modified entry through the
//! atomic-replace discipline, verifying first that the file on disk has not
//! been changed since the entry was captured.
//!
//! The buffer is intentional global state: one buffer per process, guarded
//! by a single lock, shared by all collections regardless of which thread
//! created them.

use crate::replace_file_atomic;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, error};

/// Default buffer capacity in bytes of file contents.
pub const DEFAULT_CAPACITY: usize = 32 * 1024 * 1024;

/// Errors raised by the buffering protocol.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Nested buffered contexts must not weaken the force-write flag.
    #[error("cannot enter a force-write buffered context inside a non-force-write one")]
    Nesting,

    #[error(transparent)]
    Flush(#[from] BufferedFileError),

    #[error("I/O error accessing '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Aggregate error for a flush in which one or more files could not be
/// written back, mapping each path to the reason.
#[derive(Debug, Error)]
pub struct BufferedFileError {
    pub files: Vec<(PathBuf, String)>,
}

impl BufferedFileError {
    /// Whether the given path is among the failed files.
    pub fn contains(&self, path: &Path) -> bool {
        self.files.iter().any(|(p, _)| p == path)
    }
}

impl fmt::Display for BufferedFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to flush buffered file(s): ")?;
        for (i, (path, reason)) in self.files.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "'{}' ({reason})", path.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileMetadata {
    len: u64,
    mtime: Option<SystemTime>,
}

fn file_metadata(path: &Path) -> Option<FileMetadata> {
    fs::metadata(path).ok().map(|meta| FileMetadata {
        len: meta.len(),
        mtime: meta.modified().ok(),
    })
}

#[derive(Debug)]
struct Entry {
    contents: Vec<u8>,
    // Hash of the file contents at capture time; an entry whose current
    // hash equals the baseline was never modified and is not rewritten.
    baseline_hash: String,
    // Disk metadata at capture time; None when the file did not exist.
    metadata: Option<FileMetadata>,
}

#[derive(Debug, Default)]
struct BufferState {
    entries: HashMap<PathBuf, Entry>,
    size: usize,
    // Stack of force-write flags for the active nested contexts.
    contexts: Vec<bool>,
    capacity: usize,
}

static BUFFER: Lazy<Mutex<BufferState>> = Lazy::new(|| {
    Mutex::new(BufferState {
        capacity: DEFAULT_CAPACITY,
        ..BufferState::default()
    })
});

fn content_hash(blob: &[u8]) -> String {
    format!("{:x}", md5::compute(blob))
}

/// Enter a buffered region.
///
/// Buffered contexts nest: the buffer flushes when the outermost guard is
/// released. Entering a `force_write` context while a non-force-write
/// context is active is a contract violation and fails with
/// [`BufferError::Nesting`].
pub fn buffered(force_write: bool) -> Result<BufferGuard, BufferError> {
    let mut state = lock_buffer();
    if force_write && state.contexts.iter().any(|f| !*f) {
        return Err(BufferError::Nesting);
    }
    state.contexts.push(force_write);
    debug!(depth = state.contexts.len(), force_write, "entered buffered mode");
    Ok(BufferGuard { active: true })
}

/// Whether any buffered context is currently active.
pub fn is_buffered() -> bool {
    !lock_buffer().contexts.is_empty()
}

/// Total bytes of file contents currently held in the buffer.
pub fn buffer_size() -> usize {
    lock_buffer().size
}

/// Get the configured buffer capacity in bytes.
pub fn capacity() -> usize {
    lock_buffer().capacity
}

/// Set the buffer capacity in bytes. Exceeding it on save triggers a
/// forced flush of the whole buffer.
pub fn set_capacity(bytes: usize) {
    lock_buffer().capacity = bytes;
}

/// Guard for a buffered region.
///
/// Prefer [`BufferGuard::close`], which surfaces flush errors; dropping the
/// guard flushes best-effort and logs failures.
#[must_use = "the buffer flushes when the guard is released"]
pub struct BufferGuard {
    active: bool,
}

impl BufferGuard {
    /// Leave the buffered region, flushing the buffer if this was the
    /// outermost context.
    pub fn close(mut self) -> Result<(), BufferError> {
        self.active = false;
        release()
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = release() {
                error!(%err, "buffer flush failed on drop");
            }
        }
    }
}

fn release() -> Result<(), BufferError> {
    let mut state = lock_buffer();
    state.contexts.pop();
    if state.contexts.is_empty() {
        debug!("leaving buffered mode, flushing buffer");
        flush_locked(&mut state)
    } else {
        Ok(())
    }
}

/// Record serialized contents for `path` in the buffer.
///
/// The first save for a path captures the current on-disk bytes and
/// metadata as the integrity baseline. Exceeding the capacity triggers a
/// forced flush of the entire buffer.
pub(crate) fn save(path: &Path, contents: Vec<u8>) -> Result<(), BufferError> {
    let mut state = lock_buffer();
    if let Some(entry) = state.entries.get_mut(path) {
        entry.contents = contents;
    } else {
        let (baseline_hash, metadata) = match fs::read(path) {
            Ok(disk) => (content_hash(&disk), file_metadata(path)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                (content_hash(b"null"), None)
            }
            Err(err) => {
                return Err(BufferError::Io {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        };
        state.entries.insert(
            path.to_path_buf(),
            Entry {
                contents,
                baseline_hash,
                metadata,
            },
        );
    }
    state.size = state.entries.values().map(|e| e.contents.len()).sum();
    if state.size > state.capacity {
        debug!(size = state.size, capacity = state.capacity, "buffer capacity exceeded");
        flush_locked(&mut state)?;
    }
    Ok(())
}

/// Return the buffered contents for `path` if an entry exists.
///
/// Loads never materialize entries; a miss falls through to the direct
/// file read in the caller.
pub(crate) fn load(path: &Path) -> Option<Vec<u8>> {
    lock_buffer().entries.get(path).map(|e| e.contents.clone())
}

/// Flush every buffered entry, writing back modified files and verifying
/// that no file changed on disk since it was captured. All failures are
/// collected into a single [`BufferedFileError`]; every entry is evicted
/// regardless of outcome.
pub fn flush_all() -> Result<(), BufferError> {
    flush_locked(&mut lock_buffer())
}

fn flush_locked(state: &mut BufferState) -> Result<(), BufferError> {
    let mut failures: Vec<(PathBuf, String)> = Vec::new();
    for (path, entry) in state.entries.drain() {
        if content_hash(&entry.contents) == entry.baseline_hash {
            continue;
        }
        if file_metadata(&path) != entry.metadata {
            failures.push((
                path,
                "file was modified on disk while buffered".to_string(),
            ));
            continue;
        }
        if let Err(err) = replace_file_atomic(&path, &entry.contents) {
            failures.push((path, err.to_string()));
        }
    }
    state.size = 0;
    if failures.is_empty() {
        Ok(())
    } else {
        failures.sort();
        Err(BufferedFileError { files: failures }.into())
    }
}

fn lock_buffer() -> std::sync::MutexGuard<'static, BufferState> {
    // A poisoned buffer lock means a panic mid-flush; the entries map is
    // still structurally valid, so continue with the inner state.
    BUFFER.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
