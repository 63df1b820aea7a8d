//! The synced JSON collection type.

use crate::validate::{no_dot_in_key, Validator};
use crate::{buffer, io_err, replace_file_atomic, resource_lock, Result, SyncedError};
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootKind {
    Mapping,
    Sequence,
}

/// A JSON value synchronized with a file.
///
/// The root is either a mapping or a (non-string) sequence, fixed at
/// construction. Reads refresh from the backing file before returning, and
/// every mutation validates the incoming data, applies it in memory, and
/// writes the whole value back. Nested values are addressed by key path
/// against the root; only the root ever persists.
///
/// When the process-wide buffer is active (see [`crate::buffered`]), saves
/// are deferred into the buffer and reads prefer buffered contents.
#[derive(Debug)]
pub struct SyncedJson {
    path: PathBuf,
    data: Value,
    kind: RootKind,
    validators: Vec<Validator>,
    write_concern: bool,
}

impl SyncedJson {
    /// A mapping-rooted collection backed by `path`.
    pub fn dict(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), RootKind::Mapping)
    }

    /// A sequence-rooted collection backed by `path`.
    pub fn list(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), RootKind::Sequence)
    }

    fn new(path: PathBuf, kind: RootKind) -> Self {
        Self {
            path,
            data: match kind {
                RootKind::Mapping => Value::Object(Map::new()),
                RootKind::Sequence => Value::Array(Vec::new()),
            },
            kind,
            validators: vec![no_dot_in_key],
            write_concern: true,
        }
    }

    /// Replace the validator list.
    pub fn with_validators(mut self, validators: Vec<Validator>) -> Self {
        self.validators = validators;
        self
    }

    /// Seed the in-memory value without touching the file, e.g. from a
    /// cache. The data is validated.
    pub fn with_data(mut self, data: Value) -> Result<Self> {
        self.check_kind(&data)?;
        self.validate(&data)?;
        self.data = data;
        Ok(self)
    }

    /// Disable the write-through-temporary-file discipline. Only safe for
    /// strictly single-threaded use.
    pub fn with_direct_writes(mut self) -> Self {
        self.write_concern = false;
        self
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Get a value by top-level key.
    pub fn get(&mut self, key: &str) -> Result<Option<Value>> {
        self.locked(|this| {
            this.load()?;
            Ok(this.map_ref()?.get(key).cloned())
        })
    }

    /// Get a nested value by key path.
    pub fn get_at(&mut self, keys: &[&str]) -> Result<Option<Value>> {
        self.locked(|this| {
            this.load()?;
            let mut current = &this.data;
            for key in keys {
                match current {
                    Value::Object(map) => match map.get(*key) {
                        Some(next) => current = next,
                        None => return Ok(None),
                    },
                    _ => return Ok(None),
                }
            }
            Ok(Some(current.clone()))
        })
    }

    /// Get a sequence element by index.
    pub fn get_index(&mut self, index: usize) -> Result<Option<Value>> {
        self.locked(|this| {
            this.load()?;
            Ok(this.seq_ref()?.get(index).cloned())
        })
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// The top-level keys, in file order.
    pub fn keys(&mut self) -> Result<Vec<String>> {
        self.locked(|this| {
            this.load()?;
            Ok(this.map_ref()?.keys().cloned().collect())
        })
    }

    pub fn len(&mut self) -> Result<usize> {
        self.locked(|this| {
            this.load()?;
            Ok(match &this.data {
                Value::Object(map) => map.len(),
                Value::Array(items) => items.len(),
                _ => 0,
            })
        })
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// A detached copy of the whole value.
    pub fn snapshot(&mut self) -> Result<Value> {
        self.locked(|this| {
            this.load()?;
            Ok(this.data.clone())
        })
    }

    /// A detached copy of a mapping root.
    pub fn to_map(&mut self) -> Result<Map<String, Value>> {
        self.locked(|this| {
            this.load()?;
            Ok(this.map_ref()?.clone())
        })
    }

    // ------------------------------------------------------------------
    // Mapping mutations
    // ------------------------------------------------------------------

    /// Insert a top-level key, returning the previous value.
    pub fn insert(&mut self, key: &str, value: Value) -> Result<Option<Value>> {
        let candidate = Value::Object(Map::from_iter([(key.to_string(), value.clone())]));
        self.locked(|this| {
            this.validate(&candidate)?;
            this.load()?;
            let old = this.map_mut()?.insert(key.to_string(), value);
            this.save()?;
            Ok(old)
        })
    }

    /// Remove a top-level key, returning the removed value.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        self.locked(|this| {
            this.load()?;
            let old = this.map_mut()?.remove(key);
            if old.is_some() {
                this.save()?;
            }
            Ok(old)
        })
    }

    /// Merge all entries of `other` into the mapping.
    pub fn update(&mut self, other: Map<String, Value>) -> Result<()> {
        let candidate = Value::Object(other.clone());
        self.locked(|this| {
            this.validate(&candidate)?;
            this.load()?;
            let map = this.map_mut()?;
            for (key, value) in other {
                map.insert(key, value);
            }
            this.save()
        })
    }

    /// Remove all entries.
    pub fn clear(&mut self) -> Result<()> {
        self.locked(|this| {
            this.load()?;
            match (&mut this.data, this.kind) {
                (Value::Object(map), RootKind::Mapping) => map.clear(),
                (Value::Array(items), RootKind::Sequence) => items.clear(),
                _ => {
                    this.data = match this.kind {
                        RootKind::Mapping => Value::Object(Map::new()),
                        RootKind::Sequence => Value::Array(Vec::new()),
                    }
                }
            }
            this.save()
        })
    }

    /// Replace the whole value after validation.
    pub fn reset(&mut self, data: Value) -> Result<()> {
        self.locked(|this| {
            this.check_kind(&data)?;
            this.validate(&data)?;
            this.data = data;
            this.save()
        })
    }

    /// Set a nested value by key path, creating intermediate mappings.
    pub fn set_at(&mut self, keys: &[&str], value: Value) -> Result<()> {
        let (last, prefix) = match keys.split_last() {
            Some(split) => split,
            None => return self.reset(value),
        };
        let candidate = Value::Object(Map::from_iter([(last.to_string(), value.clone())]));
        self.locked(|this| {
            for key in prefix {
                if key.contains('.') {
                    return Err(SyncedError::InvalidKey {
                        key: (*key).to_string(),
                    });
                }
            }
            this.validate(&candidate)?;
            this.load()?;
            let mut current = match this.kind {
                RootKind::Mapping => &mut this.data,
                RootKind::Sequence => {
                    return Err(SyncedError::NotAMapping {
                        path: this.path.clone(),
                    })
                }
            };
            for key in prefix {
                let map = current.as_object_mut().ok_or_else(|| SyncedError::NotAMapping {
                    path: this.path.clone(),
                })?;
                current = map
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            let map = current.as_object_mut().ok_or_else(|| SyncedError::NotAMapping {
                path: this.path.clone(),
            })?;
            map.insert(last.to_string(), value);
            this.save()
        })
    }

    /// Remove a nested value by key path.
    pub fn remove_at(&mut self, keys: &[&str]) -> Result<Option<Value>> {
        let (last, prefix) = match keys.split_last() {
            Some(split) => split,
            None => return Ok(None),
        };
        self.locked(|this| {
            this.load()?;
            let mut current = &mut this.data;
            for key in prefix {
                match current.as_object_mut().and_then(|map| map.get_mut(*key)) {
                    Some(next) => current = next,
                    None => return Ok(None),
                }
            }
            let old = current.as_object_mut().and_then(|map| map.remove(*last));
            if old.is_some() {
                this.save()?;
            }
            Ok(old)
        })
    }

    // ------------------------------------------------------------------
    // Sequence mutations
    // ------------------------------------------------------------------

    /// Append an element.
    pub fn push(&mut self, value: Value) -> Result<()> {
        self.locked(|this| {
            this.validate(&value)?;
            this.load()?;
            this.seq_mut()?.push(value);
            this.save()
        })
    }

    /// Insert an element at an index.
    pub fn insert_index(&mut self, index: usize, value: Value) -> Result<()> {
        self.locked(|this| {
            this.validate(&value)?;
            this.load()?;
            let items = this.seq_mut()?;
            if index > items.len() {
                return Err(SyncedError::IndexOutOfBounds {
                    index,
                    len: items.len(),
                });
            }
            items.insert(index, value);
            this.save()
        })
    }

    /// Remove and return the element at an index.
    pub fn remove_index(&mut self, index: usize) -> Result<Value> {
        self.locked(|this| {
            this.load()?;
            let items = this.seq_mut()?;
            if index >= items.len() {
                return Err(SyncedError::IndexOutOfBounds {
                    index,
                    len: items.len(),
                });
            }
            let old = items.remove(index);
            this.save()?;
            Ok(old)
        })
    }

    /// Append all elements.
    pub fn extend(&mut self, values: Vec<Value>) -> Result<()> {
        let candidate = Value::Array(values.clone());
        self.locked(|this| {
            this.validate(&candidate)?;
            this.load()?;
            this.seq_mut()?.extend(values);
            this.save()
        })
    }

    /// Reverse the sequence in place.
    pub fn reverse(&mut self) -> Result<()> {
        self.locked(|this| {
            this.load()?;
            this.seq_mut()?.reverse();
            this.save()
        })
    }

    // ------------------------------------------------------------------
    // Synchronization internals
    // ------------------------------------------------------------------

    fn locked<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let lock = resource_lock(&self.path);
        let _guard = lock.lock();
        f(self)
    }

    /// Refresh the in-memory value from the buffer or the file. A missing
    /// file leaves the in-memory value untouched.
    fn load(&mut self) -> Result<()> {
        if buffer::is_buffered() {
            if let Some(bytes) = buffer::load(&self.path) {
                self.data = self.decode(&bytes)?;
                return Ok(());
            }
        }
        match fs::read(&self.path) {
            Ok(bytes) => {
                self.data = self.decode(&bytes)?;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&self.path, err)),
        }
    }

    /// Persist the in-memory value, deferring into the buffer when
    /// buffering is active.
    fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.data).map_err(|err| SyncedError::Json {
            path: self.path.clone(),
            source: err,
        })?;
        if buffer::is_buffered() {
            trace!(path = %self.path.display(), "deferring save into buffer");
            buffer::save(&self.path, bytes)?;
            return Ok(());
        }
        if self.write_concern {
            replace_file_atomic(&self.path, &bytes).map_err(|err| io_err(&self.path, err))
        } else {
            fs::write(&self.path, &bytes).map_err(|err| io_err(&self.path, err))
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(bytes).map_err(|err| SyncedError::Json {
            path: self.path.clone(),
            source: err,
        })?;
        self.check_kind(&value)?;
        Ok(value)
    }

    fn check_kind(&self, value: &Value) -> Result<()> {
        match (self.kind, value) {
            (RootKind::Mapping, Value::Object(_)) | (RootKind::Sequence, Value::Array(_)) => Ok(()),
            (RootKind::Mapping, _) => Err(SyncedError::NotAMapping {
                path: self.path.clone(),
            }),
            (RootKind::Sequence, _) => Err(SyncedError::NotASequence {
                path: self.path.clone(),
            }),
        }
    }

    fn validate(&self, data: &Value) -> Result<()> {
        for validator in &self.validators {
            validator(data)?;
        }
        Ok(())
    }

    fn map_ref(&self) -> Result<&Map<String, Value>> {
        self.data.as_object().ok_or_else(|| SyncedError::NotAMapping {
            path: self.path.clone(),
        })
    }

    fn map_mut(&mut self) -> Result<&mut Map<String, Value>> {
        let path = self.path.clone();
        self.data
            .as_object_mut()
            .ok_or(SyncedError::NotAMapping { path })
    }

    fn seq_ref(&self) -> Result<&Vec<Value>> {
        self.data.as_array().ok_or_else(|| SyncedError::NotASequence {
            path: self.path.clone(),
        })
    }

    fn seq_mut(&mut self) -> Result<&mut Vec<Value>> {
        let path = self.path.clone();
        self.data
            .as_array_mut()
            .ok_or(SyncedError::NotASequence { path })
    }
}
