//! Error types for the shelfkeep storage core

/// All errors that can occur in the storage, dedupe, import and backup paths
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The reversible transform produced data that cannot be parsed. The payload is lost.
    #[error("Decode failed: {0}")]
    Decode(String),
    /// A chunk ordinal listed by the index is absent from the medium
    #[error("Corrupt store: chunk {ordinal} missing (key {key})")]
    CorruptStore {
        /// Ordinal of the first missing chunk
        ordinal: usize,
        /// Medium key that was expected to hold it
        key: String,
    },
    /// Reassembled payload length disagrees with the index
    #[error("Corrupt store: index reports {expected} bytes but chunks hold {actual}")]
    SizeMismatch {
        /// totalSize recorded in the index
        expected: usize,
        /// Bytes actually reassembled
        actual: usize,
    },
    /// Reassembled payload does not hash to the digest recorded in the index
    #[error("Corrupt store: payload digest {actual} does not match index digest {expected}")]
    ChecksumMismatch {
        /// Digest recorded in the index
        expected: String,
        /// Digest of the reassembled payload
        actual: String,
    },
    /// Caller input failed a structural check
    #[error("Validation failed: {0}")]
    Validation(String),
    /// The key-value medium refused or failed an operation
    #[error("Storage medium error: {0}")]
    Medium(String),
    /// JSON serialization or deserialization failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// CSV reading or writing failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    /// Another writer advanced the chunk index since it was read
    #[error("Conflict: expected index generation {expected}, found {found}")]
    Conflict {
        /// Generation the caller based its write on
        expected: u64,
        /// Generation currently stored
        found: u64,
    },
    /// The remote backup service could not be reached or holds no snapshot
    #[error("Backup service unavailable: {0}")]
    BackupUnavailable(String),
    /// No record with the given id
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
