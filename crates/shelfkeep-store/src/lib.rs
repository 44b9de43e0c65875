#![warn(missing_docs)]

//! shelfkeep storage core: chunked key-value persistence, reversible obfuscation, record dedupe
//!
//! Save path: Value → JSON → Obfuscate (XOR + shift + base64) → Split → Chunks + Index → one medium batch
//! Load path: Medium → Index → Chunks → Concatenate → Verify digest → Decode → JSON → Value

pub mod backup;
pub mod catalog;
pub mod chunked;
pub mod dedupe;
pub mod error;
pub mod import;
pub mod kvstore;
pub mod record;
pub mod transform;

pub use backup::{
    push_if_changed, DirectoryBackup, NullBackup, RemoteBackup, Snapshot, SNAPSHOT_FORMAT_VERSION,
};
pub use catalog::{Catalog, CatalogStats};
pub use chunked::{ChunkIndex, ChunkedStore, Loaded, StoreConfig, DEFAULT_CHUNK_SIZE};
pub use dedupe::{DuplicateGroup, DuplicateResolver, NumeralTable, Resolution, ResolverConfig};
pub use error::StoreError;
pub use import::{export_csv, fill_required, import_csv, FieldMapping, REQUIRED_FIELDS};
pub use kvstore::{BatchOp, FileKvStore, KvStore, MemoryKvStore};
pub use record::{FieldValue, Record};
pub use transform::{ObfuscationKey, ReversibleTransform};
