//! In-memory [`Store`] implementation for tests.
//!
//! Uses `BTreeMap`s behind `std::sync::RwLock`. Vector search is brute
//! force over every record that passes the filter, scored with the
//! similarity of the collection's vector index (cosine if none).
//!
//! Besides the contract, it exposes what tests need to observe the engine:
//! per-operation call counters, one-shot fault injection, and record
//! snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::similarity_score;
use crate::error::{Error, Operation, Result};
use crate::models::{
    ChunkRecord, Filter, IngestReport, Metadata, Similarity, VectorIndexConfig, FILENAME_KEY,
};

use super::{Store, DEFAULT_BATCH_SIZE};

#[derive(Default)]
struct Collection {
    records: BTreeMap<String, ChunkRecord>,
    vector_indexes: BTreeMap<String, VectorIndexConfig>,
    metadata_indexes: BTreeSet<String>,
}

impl Collection {
    fn similarity(&self) -> Similarity {
        self.vector_indexes
            .values()
            .next()
            .map(|idx| idx.similarity)
            .unwrap_or_default()
    }
}

/// In-memory store for tests.
pub struct InMemoryStore {
    connected: AtomicBool,
    batch_size: usize,
    collections: RwLock<HashMap<String, Collection>>,
    calls: Mutex<HashMap<Operation, usize>>,
    /// One-shot faults. For `IngestChunks` the value is the batch index that
    /// fails; for other operations it is ignored.
    faults: Mutex<HashMap<Operation, usize>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            connected: AtomicBool::new(false),
            batch_size: batch_size.max(1),
            collections: RwLock::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Number of times `op` has been invoked, including failed calls.
    pub fn call_count(&self, op: Operation) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.get(&op).copied().unwrap_or(0)
    }

    pub fn reset_call_counts(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make the next call of `op` fail with a backend error.
    pub fn fail_next(&self, op: Operation) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op, 0);
    }

    /// Make the next `ingest_chunks` fail when it reaches batch `batch`
    /// (zero-based). Earlier batches of that call are committed.
    pub fn fail_ingest_at_batch(&self, batch: usize) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Operation::IngestChunks, batch);
    }

    /// Snapshot of every record in `collection`, ordered by id.
    pub fn records(&self, collection: &str) -> Vec<ChunkRecord> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections
            .get(collection)
            .map(|c| c.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str) -> usize {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections.get(collection).map_or(0, |c| c.records.len())
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    pub fn has_collection(&self, collection: &str) -> bool {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections.contains_key(collection)
    }

    pub fn has_metadata_index(&self, collection: &str, field: &str) -> bool {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections
            .get(collection)
            .is_some_and(|c| c.metadata_indexes.contains(field))
    }

    /// Count the call and check readiness and injected faults.
    fn begin(&self, op: Operation) -> Result<Option<usize>> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(op)
            .or_insert(0) += 1;

        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!(
                "{} called before connect()",
                op
            )));
        }

        let fault = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&op);
        match (op, fault) {
            (Operation::IngestChunks, batch) => Ok(batch),
            (_, Some(_)) => Err(Error::backend(op, anyhow::anyhow!("injected failure"))),
            (_, None) => Ok(None),
        }
    }

    fn read(&self, op: Operation) -> Result<RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .read()
            .map_err(|_| Error::backend(op, anyhow::anyhow!("store lock poisoned")))
    }

    fn write(&self, op: Operation) -> Result<RwLockWriteGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .write()
            .map_err(|_| Error::backend(op, anyhow::anyhow!("store lock poisoned")))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn connect(&self) -> Result<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(Operation::Connect)
            .or_insert(0) += 1;
        if self.connected.swap(true, Ordering::SeqCst) {
            tracing::debug!("in-memory store already connected");
        }
        Ok(())
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        self.begin(Operation::CreateCollection)?;
        let mut collections = self.write(Operation::CreateCollection)?;
        if collections.contains_key(collection) {
            tracing::info!(collection, "collection already exists");
            return Ok(());
        }
        collections.insert(collection.to_string(), Collection::default());
        tracing::info!(collection, "collection created");
        Ok(())
    }

    async fn create_vector_index(
        &self,
        collection: &str,
        config: &VectorIndexConfig,
    ) -> Result<()> {
        self.begin(Operation::CreateVectorIndex)?;
        let mut collections = self.write(Operation::CreateVectorIndex)?;
        let entry = collections.entry(collection.to_string()).or_default();
        if entry.vector_indexes.contains_key(&config.name) {
            tracing::info!(collection, index = %config.name, "vector index already exists");
            return Ok(());
        }
        entry
            .vector_indexes
            .insert(config.name.clone(), config.clone());
        tracing::info!(collection, index = %config.name, "vector index created");
        Ok(())
    }

    async fn validate_index(&self, collection: &str, index_name: &str) -> bool {
        if let Err(e) = self.begin(Operation::ValidateIndex) {
            tracing::error!(collection, index = index_name, error = %e, "index validation failed");
            return false;
        }
        let found = match self.read(Operation::ValidateIndex) {
            Ok(collections) => collections
                .get(collection)
                .is_some_and(|c| c.vector_indexes.contains_key(index_name)),
            Err(e) => {
                tracing::error!(collection, index = index_name, error = %e, "index validation failed");
                return false;
            }
        };
        if !found {
            tracing::warn!(collection, index = index_name, "index not found");
        }
        found
    }

    async fn ingest_chunks(
        &self,
        collection: &str,
        records: &[ChunkRecord],
    ) -> Result<IngestReport> {
        let fail_at = self.begin(Operation::IngestChunks)?;
        let mut total = IngestReport::default();

        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            if fail_at == Some(batch_index) {
                tracing::error!(collection, batch = batch_index, "ingest batch failed");
                return Err(Error::backend(
                    Operation::IngestChunks,
                    anyhow::anyhow!("injected failure at batch {}", batch_index),
                ));
            }

            let mut collections = self.write(Operation::IngestChunks)?;
            let entry = collections.entry(collection.to_string()).or_default();
            let mut report = IngestReport {
                batches: 1,
                ..IngestReport::default()
            };
            for record in batch {
                match entry.records.insert(record.id.clone(), record.clone()) {
                    Some(old) => {
                        report.matched += 1;
                        if old != *record {
                            report.modified += 1;
                        }
                    }
                    None => report.inserted += 1,
                }
            }
            tracing::debug!(
                collection,
                batch = batch_index,
                matched = report.matched,
                modified = report.modified,
                inserted = report.inserted,
                "ingested batch"
            );
            total += report;
        }

        Ok(total)
    }

    async fn delete_chunks(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.begin(Operation::DeleteChunks)?;
        let mut collections = self.write(Operation::DeleteChunks)?;
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = entry.records.len();
        entry.records.retain(|_, r| !filter.matches(&r.metadata));
        let deleted = (before - entry.records.len()) as u64;
        tracing::info!(collection, %filter, deleted, "deleted chunks");
        Ok(deleted)
    }

    async fn update_chunk_metadata(
        &self,
        collection: &str,
        id: &str,
        metadata: &Metadata,
    ) -> Result<bool> {
        self.begin(Operation::UpdateChunkMetadata)?;
        let mut collections = self.write(Operation::UpdateChunkMetadata)?;
        match collections
            .get_mut(collection)
            .and_then(|c| c.records.get_mut(id))
        {
            Some(record) => {
                record.metadata = metadata.clone();
                Ok(true)
            }
            None => {
                tracing::warn!(collection, id, "chunk not found, metadata update skipped");
                Ok(false)
            }
        }
    }

    async fn get_chunk(&self, collection: &str, id: &str) -> Result<Option<ChunkRecord>> {
        self.begin(Operation::GetChunk)?;
        let collections = self.read(Operation::GetChunk)?;
        Ok(collections
            .get(collection)
            .and_then(|c| c.records.get(id))
            .cloned())
    }

    async fn get_file_info(&self, collection: &str, filename: &str) -> Result<Option<Metadata>> {
        self.begin(Operation::GetFileInfo)?;
        let collections = self.read(Operation::GetFileInfo)?;
        Ok(collections.get(collection).and_then(|c| {
            c.records
                .values()
                .find(|r| {
                    r.metadata.get(FILENAME_KEY).and_then(|v| v.as_str()) == Some(filename)
                })
                .map(|r| r.metadata.clone())
        }))
    }

    async fn create_metadata_index(&self, collection: &str, field: &str) -> Result<()> {
        self.begin(Operation::CreateMetadataIndex)?;
        let mut collections = self.write(Operation::CreateMetadataIndex)?;
        let entry = collections.entry(collection.to_string()).or_default();
        if entry.metadata_indexes.insert(field.to_string()) {
            tracing::info!(collection, field, "metadata index created");
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ChunkRecord>> {
        self.begin(Operation::Search)?;
        let collections = self.read(Operation::Search)?;
        let Some(entry) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let similarity = entry.similarity();

        let mut scored: Vec<(f32, &ChunkRecord)> = entry
            .records
            .values()
            .filter(|r| filter.map_or(true, |f| f.matches(&r.metadata)))
            .map(|r| (similarity_score(similarity, query_vector, &r.embedding), r))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored.into_iter().map(|(_, r)| r.clone()).collect())
    }
}
