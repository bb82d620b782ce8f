//! Storage abstraction for kbsync.
//!
//! The [`Store`] trait is the whole surface the reconciliation engine needs
//! from a durable vector store. Any adapter (SQLite, a document database,
//! a search engine) that implements it can back the engine; the in-memory
//! implementation in [`memory`] is used by tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Contract notes
//!
//! - Every data operation before [`connect`](Store::connect) fails with
//!   [`Error::Connection`](crate::error::Error::Connection).
//! - [`ingest_chunks`](Store::ingest_chunks) upserts by `id` in bounded
//!   batches. A failing batch stops the run and propagates; batches already
//!   committed stay committed.
//! - Deleting zero records, or patching metadata of an unknown id, is not an
//!   error.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ChunkRecord, Filter, IngestReport, Metadata, VectorIndexConfig};

/// Default number of records per upsert batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`connect`](Store::connect) | Establish readiness |
/// | [`create_collection`](Store::create_collection) | Create a collection if absent |
/// | [`create_vector_index`](Store::create_vector_index) | Define a vector index if absent |
/// | [`validate_index`](Store::validate_index) | Check that an index exists |
/// | [`ingest_chunks`](Store::ingest_chunks) | Batched upsert by id |
/// | [`delete_chunks`](Store::delete_chunks) | Delete by metadata filter |
/// | [`update_chunk_metadata`](Store::update_chunk_metadata) | Replace one record's metadata |
/// | [`get_chunk`](Store::get_chunk) | Fetch one record by id |
/// | [`get_file_info`](Store::get_file_info) | Metadata of any one chunk of a file |
/// | [`create_metadata_index`](Store::create_metadata_index) | Index a metadata field |
/// | [`search`](Store::search) | Nearest-neighbour query |
#[async_trait]
pub trait Store: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// No-op when the collection already exists.
    async fn create_collection(&self, collection: &str) -> Result<()>;

    /// No-op when an index named `config.name` already exists on the
    /// collection. The index may not be query-ready when this returns.
    async fn create_vector_index(&self, collection: &str, config: &VectorIndexConfig)
        -> Result<()>;

    /// `false` when the index is missing or the check itself failed.
    async fn validate_index(&self, collection: &str, index_name: &str) -> bool;

    async fn ingest_chunks(&self, collection: &str, records: &[ChunkRecord])
        -> Result<IngestReport>;

    /// Returns the number of records removed.
    async fn delete_chunks(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Returns whether a record with `id` was found.
    async fn update_chunk_metadata(
        &self,
        collection: &str,
        id: &str,
        metadata: &Metadata,
    ) -> Result<bool>;

    async fn get_chunk(&self, collection: &str, id: &str) -> Result<Option<ChunkRecord>>;

    /// Metadata of any one chunk whose `filename` equals `filename`.
    async fn get_file_info(&self, collection: &str, filename: &str) -> Result<Option<Metadata>>;

    async fn create_metadata_index(&self, collection: &str, field: &str) -> Result<()>;

    /// At most `limit` records, best match first.
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ChunkRecord>>;
}
