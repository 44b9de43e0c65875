//! Catalog snapshots and the remote backup seam.
//!
//! A snapshot is a JSON envelope around the obfuscated record payload. The
//! remote service that stores snapshots is external and optional: every call
//! on it may fail with `BackupUnavailable`, and callers keep working locally.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::record::Record;
use crate::transform::ReversibleTransform;

/// Envelope format written by this version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const SNAPSHOT_FILE: &str = "shelfkeep-snapshot.json";

/// A point-in-time copy of a record collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Envelope format version
    pub format_version: u32,
    /// When the snapshot was taken
    pub created_at: DateTime<Utc>,
    /// Number of records in the payload
    pub record_count: usize,
    /// Obfuscated JSON array of records
    pub payload: String,
}

impl Snapshot {
    /// Capture `records` using `transform` for the payload
    pub fn capture(records: &[Record], transform: &ReversibleTransform) -> Result<Self, StoreError> {
        let json = serde_json::to_string(records)?;
        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at: Utc::now(),
            record_count: records.len(),
            payload: transform.encode(&json),
        })
    }

    /// Recover the records held by this snapshot
    pub fn restore(&self, transform: &ReversibleTransform) -> Result<Vec<Record>, StoreError> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(StoreError::Validation(format!(
                "unsupported snapshot format version {}",
                self.format_version
            )));
        }
        let json = transform.decode(&self.payload)?;
        let records: Vec<Record> = serde_json::from_str(&json)
            .map_err(|e| StoreError::Decode(format!("snapshot payload is not valid JSON: {e}")))?;
        if records.len() != self.record_count {
            return Err(StoreError::Decode(format!(
                "snapshot declares {} records but holds {}",
                self.record_count,
                records.len()
            )));
        }
        Ok(records)
    }

    /// Serialized envelope
    pub fn to_bytes(&self) -> Result<Bytes, StoreError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse an envelope produced by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(data: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(data)
            .map_err(|e| StoreError::Decode(format!("snapshot envelope unreadable: {e}")))
    }

    /// BLAKE3 hex digest of the payload. Identifies content for change
    /// detection only; it does not authenticate anything.
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.payload.as_bytes()).to_hex().to_string()
    }
}

/// Remote snapshot storage. Optional and fallible.
#[async_trait]
pub trait RemoteBackup: Send + Sync {
    /// Fetch the most recent snapshot held remotely
    async fn fetch_remote_snapshot(&self) -> Result<Bytes, StoreError>;

    /// Replace the remote snapshot
    async fn push_snapshot(&self, snapshot: Bytes) -> Result<(), StoreError>;
}

/// Push `snapshot` unless the remote already holds the same payload.
/// Returns true if a push happened.
pub async fn push_if_changed<B: RemoteBackup + ?Sized>(
    remote: &B,
    snapshot: &Snapshot,
) -> Result<bool, StoreError> {
    match remote.fetch_remote_snapshot().await {
        Ok(bytes) => match Snapshot::from_bytes(&bytes) {
            Ok(existing) if existing.fingerprint() == snapshot.fingerprint() => {
                debug!(fingerprint = %snapshot.fingerprint(), "Remote snapshot unchanged");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Remote snapshot unreadable, overwriting"),
        },
        Err(StoreError::BackupUnavailable(reason)) => {
            debug!(%reason, "No remote snapshot to compare against");
        }
        Err(e) => return Err(e),
    }
    remote.push_snapshot(snapshot.to_bytes()?).await?;
    info!(
        records = snapshot.record_count,
        fingerprint = %snapshot.fingerprint(),
        "Pushed snapshot"
    );
    Ok(true)
}

/// Backup target that keeps the snapshot in a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryBackup {
    dir: PathBuf,
}

impl DirectoryBackup {
    /// Use `dir` as the backup location; it is created on first push
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the snapshot file
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }
}

#[async_trait]
impl RemoteBackup for DirectoryBackup {
    async fn fetch_remote_snapshot(&self) -> Result<Bytes, StoreError> {
        let path = self.snapshot_path();
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                StoreError::BackupUnavailable(format!("no snapshot at {}", path.display())),
            ),
            Err(e) => Err(StoreError::BackupUnavailable(e.to_string())),
        }
    }

    async fn push_snapshot(&self, snapshot: Bytes) -> Result<(), StoreError> {
        let unavailable = |e: std::io::Error| StoreError::BackupUnavailable(e.to_string());
        tokio::fs::create_dir_all(&self.dir).await.map_err(unavailable)?;
        let path = self.snapshot_path();
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &snapshot).await.map_err(unavailable)?;
        tokio::fs::rename(&tmp, &path).await.map_err(unavailable)?;
        debug!(path = %path.display(), bytes = snapshot.len(), "Wrote snapshot");
        Ok(())
    }
}

/// Backup target used when remote backup is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackup;

#[async_trait]
impl RemoteBackup for NullBackup {
    async fn fetch_remote_snapshot(&self) -> Result<Bytes, StoreError> {
        Err(StoreError::BackupUnavailable("remote backup disabled".to_string()))
    }

    async fn push_snapshot(&self, _snapshot: Bytes) -> Result<(), StoreError> {
        Err(StoreError::BackupUnavailable("remote backup disabled".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Record> {
        vec![
            Record::new().field("title", "Dune").field("author", "Herbert"),
            Record::new().field("title", "Emma").field("author", "Austen"),
        ]
    }

    #[test]
    fn capture_restore_roundtrip() {
        let t = ReversibleTransform::default();
        let records = sample();
        let snap = Snapshot::capture(&records, &t).unwrap();
        assert_eq!(snap.record_count, 2);
        assert!(!snap.payload.contains("Dune"));
        let bytes = snap.to_bytes().unwrap();
        let back = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back.restore(&t).unwrap(), records);
    }

    #[test]
    fn unknown_version_rejected() {
        let t = ReversibleTransform::default();
        let mut snap = Snapshot::capture(&sample(), &t).unwrap();
        snap.format_version = 99;
        assert!(matches!(snap.restore(&t), Err(StoreError::Validation(_))));
    }

    #[test]
    fn count_mismatch_is_decode_error() {
        let t = ReversibleTransform::default();
        let mut snap = Snapshot::capture(&sample(), &t).unwrap();
        snap.record_count = 5;
        assert!(matches!(snap.restore(&t), Err(StoreError::Decode(_))));
    }

    #[test]
    fn garbage_envelope_is_decode_error() {
        assert!(matches!(
            Snapshot::from_bytes(b"not json"),
            Err(StoreError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn directory_backup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backup = DirectoryBackup::new(dir.path().join("remote"));
        assert!(matches!(
            backup.fetch_remote_snapshot().await,
            Err(StoreError::BackupUnavailable(_))
        ));

        let t = ReversibleTransform::default();
        let snap = Snapshot::capture(&sample(), &t).unwrap();
        assert!(push_if_changed(&backup, &snap).await.unwrap());
        assert!(!push_if_changed(&backup, &snap).await.unwrap());

        let fetched = backup.fetch_remote_snapshot().await.unwrap();
        let restored = Snapshot::from_bytes(&fetched).unwrap().restore(&t).unwrap();
        assert_eq!(restored.len(), 2);
    }

    #[tokio::test]
    async fn null_backup_is_unavailable() {
        let t = ReversibleTransform::default();
        let snap = Snapshot::capture(&sample(), &t).unwrap();
        assert!(matches!(
            push_if_changed(&NullBackup, &snap).await,
            Err(StoreError::BackupUnavailable(_))
        ));
    }
}
