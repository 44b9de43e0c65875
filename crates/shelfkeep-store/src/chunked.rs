//! Chunked persistence of a serialized value across a key-value medium.
//!
//! A value is serialized to JSON, obfuscated, and split into ordinal chunks
//! of at most `chunk_size` bytes stored under `chunk_prefix + ordinal`. A
//! single index record under `index_key` says how many chunks to read back.
//! The chunks, the index and the removal of surplus chunks from an earlier,
//! larger save go to the medium as one batch, so a failed save leaves the
//! previous value readable. The index also records a BLAKE3 digest of the
//! payload, and a load that reassembles anything else fails instead of
//! returning it.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::kvstore::{BatchOp, KvStore};
use crate::transform::{ObfuscationKey, ReversibleTransform};

/// Default chunk size: 4 MiB, under the usual 5 MiB browser storage ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Default key prefix for chunk slots.
pub const DEFAULT_CHUNK_PREFIX: &str = "shelfkeep_chunk_";
/// Default key of the chunk index.
pub const DEFAULT_INDEX_KEY: &str = "shelfkeep_index";

/// Metadata describing the persisted chunk set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkIndex {
    /// Number of chunk slots holding the payload
    pub total_chunks: usize,
    /// Length of the transformed payload in bytes
    pub total_size: usize,
    /// Time of the last save; None after a reset
    pub last_update: Option<DateTime<Utc>>,
    /// Incremented on every save or cleanup
    #[serde(default)]
    pub generation: u64,
    /// BLAKE3 hex digest of the transformed payload; None when nothing is stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ChunkIndex {
    /// Index state with nothing stored
    pub fn empty() -> Self {
        Self {
            total_chunks: 0,
            total_size: 0,
            last_update: None,
            generation: 0,
            checksum: None,
        }
    }
}

/// Outcome of a load
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    /// A value was reassembled
    Present(T),
    /// A save happened, but of an empty value (`null`, `[]` or `{}`)
    Empty,
    /// Nothing has been saved, or the store was cleaned up
    NotFound,
}

impl<T> Loaded<T> {
    /// The loaded value, if any
    pub fn into_value(self) -> Option<T> {
        match self {
            Loaded::Present(v) => Some(v),
            Loaded::Empty | Loaded::NotFound => None,
        }
    }

    /// True when no save has ever been recorded
    pub fn is_not_found(&self) -> bool {
        matches!(self, Loaded::NotFound)
    }
}

impl<T: Default> Loaded<T> {
    /// The loaded value, or `T::default()` for Empty and NotFound
    pub fn unwrap_or_default(self) -> T {
        self.into_value().unwrap_or_default()
    }
}

/// Configuration for a chunked store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum bytes per chunk slot
    pub chunk_size: usize,
    /// Key prefix for chunk slots; the ordinal is appended
    pub chunk_prefix: String,
    /// Key holding the chunk index
    pub index_key: String,
    /// Obfuscation key; the built-in default is used when absent
    pub obfuscation_key: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_prefix: DEFAULT_CHUNK_PREFIX.to_string(),
            index_key: DEFAULT_INDEX_KEY.to_string(),
            obfuscation_key: None,
        }
    }
}

impl StoreConfig {
    /// Check the configuration for values the store cannot work with.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.chunk_size == 0 {
            return Err(StoreError::Validation("chunk_size must be > 0".to_string()));
        }
        if self.chunk_prefix.is_empty() {
            return Err(StoreError::Validation(
                "chunk_prefix must not be empty".to_string(),
            ));
        }
        if self.index_key.starts_with(&self.chunk_prefix) {
            return Err(StoreError::Validation(format!(
                "index key {} falls under chunk prefix {}",
                self.index_key, self.chunk_prefix
            )));
        }
        Ok(())
    }
}

/// Split `payload` into pieces of at most `size` bytes on char boundaries.
pub fn split_chunks(payload: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(size.max(1)));
    let mut start = 0;
    while start < payload.len() {
        let mut end = (start + size).min(payload.len());
        while !payload.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single char wider than `size`; emit it whole.
            end = start + 1;
            while !payload.is_char_boundary(end) {
                end += 1;
            }
        }
        chunks.push(&payload[start..end]);
        start = end;
    }
    chunks
}

fn is_empty_json(json: &str) -> bool {
    matches!(json, "null" | "[]" | "{}")
}

fn payload_digest(payload: &str) -> String {
    blake3::hash(payload.as_bytes()).to_hex().to_string()
}

/// Persists one logical value as an index plus ordinal chunks.
pub struct ChunkedStore<S: KvStore> {
    medium: S,
    config: StoreConfig,
    transform: ReversibleTransform,
}

impl<S: KvStore> ChunkedStore<S> {
    /// Create a store over `medium`. Fails on an invalid configuration.
    pub fn new(medium: S, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let key = match &config.obfuscation_key {
            Some(k) => ObfuscationKey::new(k.as_bytes().to_vec())?,
            None => ObfuscationKey::default(),
        };
        Ok(Self {
            medium,
            config,
            transform: ReversibleTransform::new(key),
        })
    }

    /// Create a store with the default configuration
    pub fn with_defaults(medium: S) -> Self {
        Self {
            medium,
            config: StoreConfig::default(),
            transform: ReversibleTransform::default(),
        }
    }

    /// Access the underlying medium
    pub fn medium(&self) -> &S {
        &self.medium
    }

    /// Access store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Transform applied to payloads
    pub fn transform(&self) -> &ReversibleTransform {
        &self.transform
    }

    /// Medium key of chunk `ordinal`
    pub fn chunk_key(&self, ordinal: usize) -> String {
        format!("{}{}", self.config.chunk_prefix, ordinal)
    }

    /// Current chunk index, or None if no index key exists.
    pub fn index(&self) -> Result<Option<ChunkIndex>, StoreError> {
        match self.medium.get(&self.config.index_key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Decode(format!("chunk index unreadable: {e}"))),
            None => Ok(None),
        }
    }

    /// Serialize, obfuscate, chunk and persist `value`. Returns the new index.
    pub fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<ChunkIndex, StoreError> {
        self.write(value, None)
    }

    /// Like [`save`](Self::save), but refuses to write when the stored index
    /// generation is not `expected` (0 when nothing is stored).
    pub fn save_if_generation<T: Serialize + ?Sized>(
        &self,
        value: &T,
        expected: u64,
    ) -> Result<ChunkIndex, StoreError> {
        self.write(value, Some(expected))
    }

    #[instrument(skip(self, value), fields(prefix = %self.config.chunk_prefix))]
    fn write<T: Serialize + ?Sized>(
        &self,
        value: &T,
        expected: Option<u64>,
    ) -> Result<ChunkIndex, StoreError> {
        let generation = self.index()?.map(|i| i.generation).unwrap_or(0);
        if let Some(expected) = expected {
            if expected != generation {
                warn!(expected, found = generation, "Refusing save on stale generation");
                return Err(StoreError::Conflict {
                    expected,
                    found: generation,
                });
            }
        }

        let json = serde_json::to_string(value)?;
        let payload = if is_empty_json(&json) {
            String::new()
        } else {
            self.transform.encode(&json)
        };
        let chunks = split_chunks(&payload, self.config.chunk_size);

        let index = ChunkIndex {
            total_chunks: chunks.len(),
            total_size: payload.len(),
            last_update: Some(Utc::now()),
            generation: generation + 1,
            checksum: (!payload.is_empty()).then(|| payload_digest(&payload)),
        };
        let stale = self.chunk_keys_from(chunks.len())?;
        let swept = stale.len();

        let mut ops: Vec<BatchOp> = chunks
            .iter()
            .enumerate()
            .map(|(ordinal, chunk)| BatchOp::Put {
                key: self.chunk_key(ordinal),
                value: chunk.to_string(),
            })
            .collect();
        ops.push(BatchOp::Put {
            key: self.config.index_key.clone(),
            value: serde_json::to_string(&index)?,
        });
        ops.extend(stale.into_iter().map(|key| BatchOp::Delete { key }));
        self.medium.write_batch(ops)?;

        info!(
            json_bytes = json.len(),
            total_size = index.total_size,
            total_chunks = index.total_chunks,
            swept,
            generation = index.generation,
            "Saved chunked payload"
        );
        Ok(index)
    }

    /// Read the index and reassemble the stored value.
    #[instrument(skip(self), fields(prefix = %self.config.chunk_prefix))]
    pub fn load<T: DeserializeOwned>(&self) -> Result<Loaded<T>, StoreError> {
        let index = match self.index()? {
            Some(index) => index,
            None => {
                debug!("No chunk index present");
                return Ok(Loaded::NotFound);
            }
        };
        if index.total_chunks == 0 {
            return Ok(if index.last_update.is_some() {
                Loaded::Empty
            } else {
                Loaded::NotFound
            });
        }

        let mut payload = String::with_capacity(index.total_size);
        for ordinal in 0..index.total_chunks {
            let key = self.chunk_key(ordinal);
            match self.medium.get(&key)? {
                Some(chunk) => payload.push_str(&chunk),
                None => {
                    warn!(ordinal, key = %key, total = index.total_chunks, "Chunk missing");
                    return Err(StoreError::CorruptStore { ordinal, key });
                }
            }
        }
        if payload.len() != index.total_size {
            return Err(StoreError::SizeMismatch {
                expected: index.total_size,
                actual: payload.len(),
            });
        }
        if let Some(expected) = index.checksum {
            let actual = payload_digest(&payload);
            if actual != expected {
                warn!(%expected, %actual, "Payload digest mismatch");
                return Err(StoreError::ChecksumMismatch { expected, actual });
            }
        }

        let json = self.transform.decode(&payload)?;
        let value = serde_json::from_str(&json)
            .map_err(|e| StoreError::Decode(format!("payload is not valid JSON: {e}")))?;
        debug!(
            total_chunks = index.total_chunks,
            total_size = index.total_size,
            "Loaded chunked payload"
        );
        Ok(Loaded::Present(value))
    }

    /// Delete every key under the chunk prefix and reset the index to the
    /// empty state. Returns the number of keys removed.
    ///
    /// An index that no longer parses does not stop the cleanup, since this
    /// is how a damaged store gets reset.
    #[instrument(skip(self), fields(prefix = %self.config.chunk_prefix))]
    pub fn cleanup(&self) -> Result<usize, StoreError> {
        let previous = match self.index() {
            Ok(previous) => previous,
            Err(StoreError::Decode(reason)) => {
                warn!(%reason, "Chunk index unreadable, sweeping by prefix");
                None
            }
            Err(e) => return Err(e),
        };
        let stale = self.medium.keys_with_prefix(&self.config.chunk_prefix)?;
        let removed = stale.len();
        let reset = ChunkIndex {
            generation: previous.map(|i| i.generation + 1).unwrap_or(0),
            ..ChunkIndex::empty()
        };

        let mut ops: Vec<BatchOp> = stale.into_iter().map(|key| BatchOp::Delete { key }).collect();
        ops.push(BatchOp::Put {
            key: self.config.index_key.clone(),
            value: serde_json::to_string(&reset)?,
        });
        self.medium.write_batch(ops)?;
        info!(removed, "Chunk store cleaned up");
        Ok(removed)
    }

    /// Stored chunk keys with an ordinal >= `keep`. Only keys spelled exactly
    /// as [`chunk_key`](Self::chunk_key) would spell them count, so foreign
    /// keys such as `prefix+3` or `prefix007` are left alone.
    fn chunk_keys_from(&self, keep: usize) -> Result<Vec<String>, StoreError> {
        let prefix = &self.config.chunk_prefix;
        let stale: Vec<String> = self
            .medium
            .keys_with_prefix(prefix)?
            .into_iter()
            .filter(|key| match key[prefix.len()..].parse::<usize>() {
                Ok(ordinal) => ordinal >= keep && *key == self.chunk_key(ordinal),
                Err(_) => false,
            })
            .collect();
        if !stale.is_empty() {
            debug!(keep, stale = stale.len(), "Sweeping stale chunks");
        }
        Ok(stale)
    }
}
