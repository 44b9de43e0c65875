//! Catalog facade over the chunked store.
//!
//! Holds the record collection in memory and re-persists it after every
//! mutation with a generation-checked save, so two catalogs sharing one
//! medium cannot silently overwrite each other.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::Serialize;
use tracing::{info, instrument};

use crate::backup::{push_if_changed, RemoteBackup, Snapshot};
use crate::chunked::{ChunkIndex, ChunkedStore, Loaded};
use crate::dedupe::{DuplicateGroup, DuplicateResolver, Resolution};
use crate::error::StoreError;
use crate::import::{export_csv, fill_required, import_csv, FieldMapping};
use crate::kvstore::KvStore;
use crate::record::{FieldValue, Record};

/// Summary counts over the collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    /// Number of records
    pub total: usize,
    /// Records per `category` value
    pub by_category: BTreeMap<String, usize>,
    /// Records per `status` value
    pub by_status: BTreeMap<String, usize>,
}

/// Record collection persisted through a [`ChunkedStore`].
pub struct Catalog<S: KvStore> {
    store: ChunkedStore<S>,
    resolver: DuplicateResolver,
    records: Vec<Record>,
    generation: u64,
}

impl<S: KvStore> Catalog<S> {
    /// Load the collection from `store`. A store with nothing saved opens empty.
    pub fn open(store: ChunkedStore<S>, resolver: DuplicateResolver) -> Result<Self, StoreError> {
        let generation = store.index()?.map(|i| i.generation).unwrap_or(0);
        let loaded: Loaded<Vec<Record>> = store.load()?;
        let state = match &loaded {
            Loaded::Present(_) => "present",
            Loaded::Empty => "empty",
            Loaded::NotFound => "not found",
        };
        let records = loaded.unwrap_or_default();
        info!(records = records.len(), generation, state, "Catalog opened");
        Ok(Self {
            store,
            resolver,
            records,
            generation,
        })
    }

    /// All records in insertion order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the catalog holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record by id
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Underlying chunked store
    pub fn store(&self) -> &ChunkedStore<S> {
        &self.store
    }

    /// Current chunk index of the backing store
    pub fn index(&self) -> Result<Option<ChunkIndex>, StoreError> {
        self.store.index()
    }

    fn commit(&mut self, records: Vec<Record>) -> Result<(), StoreError> {
        let index = self.store.save_if_generation(&records, self.generation)?;
        self.generation = index.generation;
        self.records = records;
        Ok(())
    }

    /// Add a record, filling required placeholders. Returns its id.
    pub fn add(&mut self, mut record: Record) -> Result<String, StoreError> {
        if self.get(&record.id).is_some() {
            return Err(StoreError::Validation(format!(
                "record id {} already exists",
                record.id
            )));
        }
        fill_required(&mut record);
        let id = record.id.clone();
        let mut records = self.records.clone();
        records.push(record);
        self.commit(records)?;
        Ok(id)
    }

    /// Set fields on an existing record
    pub fn update<I, K, V>(&mut self, id: &str, fields: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let mut records = self.records.clone();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
        for (name, value) in fields {
            record.set(name, value);
        }
        fill_required(record);
        self.commit(records)
    }

    /// Remove a record by id, returning it
    pub fn remove(&mut self, id: &str) -> Result<Record, StoreError> {
        let pos = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
        let mut records = self.records.clone();
        let removed = records.remove(pos);
        self.commit(records)?;
        Ok(removed)
    }

    /// Records containing `query` in any field, case-insensitively
    pub fn search(&self, query: &str) -> Vec<&Record> {
        self.records.iter().filter(|r| r.matches(query)).collect()
    }

    /// Records whose `field` equals `value` after trimming and case-folding
    pub fn filter_by(&self, field: &str, value: &str) -> Vec<&Record> {
        let wanted = value.trim().to_lowercase();
        self.records
            .iter()
            .filter(|r| r.text(field).trim().to_lowercase() == wanted)
            .collect()
    }

    /// Counts by category and status
    pub fn stats(&self) -> CatalogStats {
        let mut stats = CatalogStats {
            total: self.records.len(),
            ..Default::default()
        };
        for record in &self.records {
            if let Some(category) = record.get("category") {
                *stats.by_category.entry(category.as_text()).or_insert(0) += 1;
            }
            if let Some(status) = record.get("status") {
                *stats.by_status.entry(status.as_text()).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Duplicate groups under `fields`, without changing anything
    pub fn preview_duplicates<F: AsRef<str>>(
        &self,
        fields: &[F],
    ) -> Result<Vec<DuplicateGroup>, StoreError> {
        self.resolver.find_duplicates(&self.records, fields)
    }

    /// Remove duplicates under `fields` and persist the survivors
    #[instrument(skip(self, by), fields(records = self.records.len()))]
    pub fn dedupe<F: AsRef<str>>(&mut self, by: &[F]) -> Result<Resolution, StoreError> {
        let resolution = self.resolver.resolve(self.records.clone(), by)?;
        if resolution.removed > 0 {
            self.commit(resolution.kept.clone())?;
        }
        Ok(resolution)
    }

    /// Import CSV rows. With `replace` the current collection is discarded,
    /// otherwise rows are appended. Returns the number of rows imported.
    pub fn import_csv<R: Read>(
        &mut self,
        reader: R,
        mapping: &FieldMapping,
        replace: bool,
    ) -> Result<usize, StoreError> {
        let imported = import_csv(reader, mapping)?;
        let count = imported.len();
        let mut records = if replace {
            Vec::new()
        } else {
            self.records.clone()
        };
        for record in imported {
            if records.iter().any(|r| r.id == record.id) {
                return Err(StoreError::Validation(format!(
                    "imported id {} already exists",
                    record.id
                )));
            }
            records.push(record);
        }
        self.commit(records)?;
        Ok(count)
    }

    /// Write the collection as CSV
    pub fn export_csv<W: Write>(&self, writer: W, mapping: &FieldMapping) -> Result<(), StoreError> {
        export_csv(&self.records, mapping, writer)
    }

    /// Snapshot of the current collection
    pub fn snapshot(&self) -> Result<Snapshot, StoreError> {
        Snapshot::capture(&self.records, self.store.transform())
    }

    /// Replace the collection with the contents of `snapshot`
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<usize, StoreError> {
        let records = snapshot.restore(self.store.transform())?;
        let count = records.len();
        self.commit(records)?;
        info!(records = count, taken = %snapshot.created_at, "Restored snapshot");
        Ok(count)
    }

    /// Push a snapshot to `remote` if it differs from what is there
    pub async fn backup_to<B: RemoteBackup + ?Sized>(&self, remote: &B) -> Result<bool, StoreError> {
        let snapshot = self.snapshot()?;
        push_if_changed(remote, &snapshot).await
    }

    /// Replace the collection with the snapshot held by `remote`
    pub async fn restore_from<B: RemoteBackup + ?Sized>(
        &mut self,
        remote: &B,
    ) -> Result<usize, StoreError> {
        let bytes = remote.fetch_remote_snapshot().await?;
        let snapshot = Snapshot::from_bytes(&bytes)?;
        self.restore(&snapshot)
    }

    /// Delete all persisted chunks and empty the collection
    pub fn clear(&mut self) -> Result<usize, StoreError> {
        let removed = self.store.cleanup()?;
        self.generation = self.store.index()?.map(|i| i.generation).unwrap_or(0);
        self.records.clear();
        Ok(removed)
    }
}
