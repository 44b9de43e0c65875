//! Key-value medium the chunked store persists into.
//!
//! The medium stores string values under string keys and may impose a
//! ceiling on value length. `MemoryKvStore` is the in-process medium used
//! for tests and embedding; `FileKvStore` keeps the same map in a JSON file
//! so a catalog survives across CLI invocations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::StoreError;

/// Key-value medium trait.
///
/// Implementations only need to serve one logical writer at a time; callers
/// that share a medium between writers must use the versioned save on the
/// chunked store.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a key to a value, overwriting any existing value.
    fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove a key. Returns Ok(()) even if the key didn't exist.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// All keys currently present, in sorted order.
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Keys starting with `prefix`, in sorted order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// Apply `ops` as one unit: either all of them take effect or none do.
    ///
    /// The default applies the operations one by one and, when one fails,
    /// restores the prior value of every key already touched before
    /// returning the original error. Media that can commit a batch natively
    /// should override this.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut undo: Vec<(String, Option<String>)> = Vec::with_capacity(ops.len());
        for op in ops {
            let key = op.key().to_string();
            let applied = self.get(&key).and_then(|prior| {
                match op {
                    BatchOp::Put { value, .. } => self.set(&key, value),
                    BatchOp::Delete { .. } => self.remove(&key),
                }
                .map(|()| prior)
            });
            match applied {
                Ok(prior) => undo.push((key, prior)),
                Err(e) => {
                    for (key, prior) in undo.into_iter().rev() {
                        let restored = match prior {
                            Some(value) => self.set(&key, value),
                            None => self.remove(&key),
                        };
                        if let Err(undo_err) = restored {
                            warn!(key = %key, error = %undo_err, "Batch rollback failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put {
        /// The key to write.
        key: String,
        /// The value to store.
        value: String,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: String,
    },
}

impl BatchOp {
    /// Key the operation touches
    pub fn key(&self) -> &str {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

fn apply_batch(data: &mut BTreeMap<String, String>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

fn check_batch_limits(limit: Option<usize>, ops: &[BatchOp]) -> Result<(), StoreError> {
    for op in ops {
        if let BatchOp::Put { key, value } = op {
            check_limit(limit, key, value)?;
        }
    }
    Ok(())
}

fn check_limit(limit: Option<usize>, key: &str, value: &str) -> Result<(), StoreError> {
    match limit {
        Some(max) if value.len() > max => Err(StoreError::Medium(format!(
            "value for key {key} is {} bytes, medium ceiling is {max}",
            value.len()
        ))),
        _ => Ok(()),
    }
}

/// In-memory medium backed by a BTreeMap. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<String, String>>>,
    value_limit: Option<usize>,
}

impl MemoryKvStore {
    /// Creates a new empty medium with no value ceiling.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a medium that rejects values longer than `limit` bytes.
    pub fn with_value_limit(limit: usize) -> Self {
        Self {
            data: Arc::default(),
            value_limit: Some(limit),
        }
    }

    /// Number of keys present.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// True if no keys are present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        check_limit(self.value_limit, key, &value)?;
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        data.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        Ok(data.keys().cloned().collect())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        let mut result = Vec::new();
        for (k, _) in data.range::<String, _>(prefix.to_string()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push(k.clone());
        }
        Ok(result)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        check_batch_limits(self.value_limit, &ops)?;
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        apply_batch(&mut data, ops);
        Ok(())
    }
}

/// Medium persisted as a single JSON object on disk.
///
/// The whole map is held in memory and rewritten after every mutation via a
/// temporary file and rename, so a crash leaves either the old or the new map.
/// A mutation is applied to a copy of the map, and the copy replaces the
/// in-memory map only once it is on disk.
pub struct FileKvStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, String>>,
    value_limit: Option<usize>,
}

impl FileKvStore {
    /// Open the medium at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), keys = data.len(), "Opened file medium");
        Ok(Self {
            path,
            data: RwLock::new(data),
            value_limit: None,
        })
    }

    /// Reject values longer than `limit` bytes, like a browser storage quota.
    pub fn with_value_limit(mut self, limit: usize) -> Self {
        self.value_limit = Some(limit);
        self
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, data: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(data)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn commit(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        let mut next = data.clone();
        mutate(&mut next);
        if next == *data {
            return Ok(());
        }
        self.flush(&next)?;
        *data = next;
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        check_limit(self.value_limit, key, &value)?;
        self.commit(|data| {
            data.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.commit(|data| {
            data.remove(key);
        })
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Medium(e.to_string()))?;
        Ok(data.keys().cloned().collect())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        check_batch_limits(self.value_limit, &ops)?;
        self.commit(|data| apply_batch(data, ops))
    }
}
