//! SQLite-backed [`Store`] implementation.
//!
//! All collections share one `chunks` table keyed by `(collection, id)`.
//! Metadata is stored as JSON text and filtered with `json_extract`;
//! embeddings are little-endian f32 BLOBs scored in process, so search is a
//! brute-force scan over the rows that pass the filter.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool};
use sqlx::Row;

use kbsync_core::embedding::{blob_to_vec, similarity_score, vec_to_blob};
use kbsync_core::error::{Error, Operation, Result};
use kbsync_core::models::{
    ChunkRecord, Filter, IngestReport, Metadata, Similarity, VectorIndexConfig, FILENAME_KEY,
};
use kbsync_core::store::{Store, DEFAULT_BATCH_SIZE};

use crate::db;
use crate::migrate;

/// SQLite implementation of the [`Store`] trait.
///
/// The pool is opened lazily by [`Store::connect`]; every other method
/// fails with [`Error::Connection`] until then.
pub struct SqliteStore {
    db_path: PathBuf,
    batch_size: usize,
    pool: OnceLock<SqlitePool>,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self::with_batch_size(db_path, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(db_path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            db_path: db_path.into(),
            batch_size: batch_size.max(1),
            pool: OnceLock::new(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Close the pool if it was opened.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    fn pool(&self, op: Operation) -> Result<&SqlitePool> {
        self.pool
            .get()
            .ok_or_else(|| Error::Connection(format!("{} called before connect()", op)))
    }

    async fn ingest_batch(
        pool: &SqlitePool,
        collection: &str,
        batch: &[ChunkRecord],
    ) -> anyhow::Result<IngestReport> {
        let mut report = IngestReport {
            batches: 1,
            ..IngestReport::default()
        };
        let mut tx = pool.begin().await?;

        // Write first: a read-then-write transaction fails instead of waiting
        // when another writer commits in between.
        sqlx::query("INSERT OR IGNORE INTO collections (name) VALUES (?)")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        for record in batch {
            let blob = vec_to_blob(&record.embedding);
            let metadata_json = serde_json::to_string(&record.metadata)?;

            let existing = sqlx::query(
                "SELECT text, embedding, metadata_json FROM chunks WHERE collection = ? AND id = ?",
            )
            .bind(collection)
            .bind(&record.id)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(row) => {
                    report.matched += 1;
                    let text: String = row.get("text");
                    let embedding: Vec<u8> = row.get("embedding");
                    let stored_json: String = row.get("metadata_json");
                    let stored: Metadata = serde_json::from_str(&stored_json).unwrap_or_default();
                    if text != record.text || embedding != blob || stored != record.metadata {
                        report.modified += 1;
                    }
                }
                None => report.inserted += 1,
            }

            sqlx::query(
                r#"
                INSERT INTO chunks (collection, id, text, embedding, metadata_json)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    text = excluded.text,
                    embedding = excluded.embedding,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(collection)
            .bind(&record.id)
            .bind(&record.text)
            .bind(&blob)
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(report)
    }
}

/// Map a driver error to a backend failure, logging it first.
fn backend(op: Operation) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| {
        tracing::error!(%op, error = %e, "sqlite operation failed");
        Error::backend(op, e)
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow, op: Operation) -> Result<ChunkRecord> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata =
        serde_json::from_str(&metadata_json).map_err(|e| Error::backend(op, e))?;
    let embedding: Vec<u8> = row.get("embedding");
    Ok(ChunkRecord::new(
        row.get("id"),
        row.get("text"),
        blob_to_vec(&embedding),
        metadata,
    ))
}

fn parse_similarity(s: &str) -> Similarity {
    match s {
        "euclidean" => Similarity::Euclidean,
        "dotProduct" => Similarity::DotProduct,
        _ => Similarity::Cosine,
    }
}

// ─── Filter compilation ─────────────────────────────────────────────

enum Param {
    Text(String),
    Int(i64),
    Real(f64),
}

/// Metadata field names are spliced into JSON paths, so only a safe
/// alphabet is accepted.
fn validate_field(field: &str) -> Result<()> {
    let ok = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid metadata field name '{}': use letters, digits, '_' or '-'",
            field
        )))
    }
}

fn json_path(field: &str) -> String {
    format!("'$.\"{}\"'", field)
}

/// Compile `filter` into ` AND ...` clauses plus their bound parameters.
fn compile_filter(filter: Option<&Filter>) -> Result<(String, Vec<Param>)> {
    let mut sql = String::new();
    let mut params = Vec::new();
    let Some(filter) = filter else {
        return Ok((sql, params));
    };

    for (field, value) in filter.conditions() {
        validate_field(field)?;
        let path = json_path(field);
        match value {
            Value::Null => {
                sql.push_str(&format!(" AND json_type(metadata_json, {}) = 'null'", path));
            }
            Value::Bool(b) => {
                sql.push_str(&format!(
                    " AND json_type(metadata_json, {}) = '{}'",
                    path,
                    if *b { "true" } else { "false" }
                ));
            }
            Value::Number(n) => {
                sql.push_str(&format!(" AND json_extract(metadata_json, {}) = ?", path));
                match n.as_i64() {
                    Some(i) => params.push(Param::Int(i)),
                    None => params.push(Param::Real(n.as_f64().unwrap_or(f64::NAN))),
                }
            }
            Value::String(s) => {
                sql.push_str(&format!(" AND json_extract(metadata_json, {}) = ?", path));
                params.push(Param::Text(s.clone()));
            }
            Value::Array(_) | Value::Object(_) => {
                sql.push_str(&format!(
                    " AND json_extract(metadata_json, {}) = json(?)",
                    path
                ));
                params.push(Param::Text(value.to_string()));
            }
        }
    }
    Ok((sql, params))
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Param],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Param::Text(s) => query.bind(s.as_str()),
            Param::Int(i) => query.bind(*i),
            Param::Real(f) => query.bind(*f),
        };
    }
    query
}

#[async_trait]
impl Store for SqliteStore {
    async fn connect(&self) -> Result<()> {
        if self.pool.get().is_some() {
            tracing::debug!(path = %self.db_path.display(), "sqlite store already connected");
            return Ok(());
        }

        let pool = db::connect(&self.db_path)
            .await
            .map_err(|e| Error::Connection(format!("{}: {:#}", self.db_path.display(), e)))?;
        migrate::run_migrations(&pool)
            .await
            .map_err(|e| Error::Connection(format!("schema setup failed: {}", e)))?;

        if self.pool.set(pool).is_err() {
            tracing::debug!("sqlite store connected concurrently, keeping first pool");
        } else {
            tracing::info!(path = %self.db_path.display(), "connected to sqlite store");
        }
        Ok(())
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        let op = Operation::CreateCollection;
        let pool = self.pool(op)?;
        let result = sqlx::query("INSERT OR IGNORE INTO collections (name) VALUES (?)")
            .bind(collection)
            .execute(pool)
            .await
            .map_err(backend(op))?;
        if result.rows_affected() == 0 {
            tracing::info!(collection, "collection already exists");
        } else {
            tracing::info!(collection, "collection created");
        }
        Ok(())
    }

    async fn create_vector_index(
        &self,
        collection: &str,
        config: &VectorIndexConfig,
    ) -> Result<()> {
        let op = Operation::CreateVectorIndex;
        let pool = self.pool(op)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO vector_indexes
                (collection, name, dimensions, path, similarity, candidate_count)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(collection)
        .bind(&config.name)
        .bind(config.dimensions as i64)
        .bind(&config.path)
        .bind(config.similarity.as_str())
        .bind(config.candidate_count as i64)
        .execute(pool)
        .await
        .map_err(backend(op))?;
        if result.rows_affected() == 0 {
            tracing::info!(collection, index = %config.name, "vector index already exists");
        } else {
            tracing::info!(
                collection,
                index = %config.name,
                dimensions = config.dimensions,
                similarity = %config.similarity,
                "vector index created"
            );
        }
        Ok(())
    }

    async fn validate_index(&self, collection: &str, index_name: &str) -> bool {
        let op = Operation::ValidateIndex;
        let pool = match self.pool(op) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(collection, index = index_name, error = %e, "index validation failed");
                return false;
            }
        };
        let found = sqlx::query(
            "SELECT 1 FROM vector_indexes WHERE collection = ? AND name = ?",
        )
        .bind(collection)
        .bind(index_name)
        .fetch_optional(pool)
        .await;
        match found {
            Ok(Some(_)) => true,
            Ok(None) => {
                tracing::warn!(collection, index = index_name, "index not found");
                false
            }
            Err(e) => {
                tracing::error!(collection, index = index_name, error = %e, "index validation failed");
                false
            }
        }
    }

    async fn ingest_chunks(
        &self,
        collection: &str,
        records: &[ChunkRecord],
    ) -> Result<IngestReport> {
        let op = Operation::IngestChunks;
        let pool = self.pool(op)?;
        let mut total = IngestReport::default();

        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            let report = Self::ingest_batch(pool, collection, batch)
                .await
                .map_err(|e| {
                    tracing::error!(collection, batch = batch_index, error = %e, "ingest batch failed");
                    Error::backend(op, e)
                })?;
            total += report;
        }

        tracing::info!(
            collection,
            batches = total.batches,
            matched = total.matched,
            modified = total.modified,
            inserted = total.inserted,
            "ingested chunks"
        );
        Ok(total)
    }

    async fn delete_chunks(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let op = Operation::DeleteChunks;
        let pool = self.pool(op)?;
        let (clauses, params) = compile_filter(Some(filter))?;
        let sql = format!("DELETE FROM chunks WHERE collection = ?{}", clauses);
        let result = bind_params(sqlx::query(&sql).bind(collection), &params)
            .execute(pool)
            .await
            .map_err(backend(op))?;
        let deleted = result.rows_affected();
        tracing::info!(collection, %filter, deleted, "deleted chunks");
        Ok(deleted)
    }

    async fn update_chunk_metadata(
        &self,
        collection: &str,
        id: &str,
        metadata: &Metadata,
    ) -> Result<bool> {
        let op = Operation::UpdateChunkMetadata;
        let pool = self.pool(op)?;
        let metadata_json = serde_json::to_string(metadata).map_err(|e| Error::backend(op, e))?;
        let result =
            sqlx::query("UPDATE chunks SET metadata_json = ? WHERE collection = ? AND id = ?")
                .bind(&metadata_json)
                .bind(collection)
                .bind(id)
                .execute(pool)
                .await
                .map_err(backend(op))?;
        if result.rows_affected() == 0 {
            tracing::warn!(collection, id, "chunk not found, metadata update skipped");
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_chunk(&self, collection: &str, id: &str) -> Result<Option<ChunkRecord>> {
        let op = Operation::GetChunk;
        let pool = self.pool(op)?;
        let row = sqlx::query(
            "SELECT id, text, embedding, metadata_json FROM chunks WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(backend(op))?;
        row.map(|row| row_to_record(&row, op)).transpose()
    }

    async fn get_file_info(&self, collection: &str, filename: &str) -> Result<Option<Metadata>> {
        let op = Operation::GetFileInfo;
        let pool = self.pool(op)?;
        let sql = format!(
            "SELECT metadata_json FROM chunks WHERE collection = ? AND json_extract(metadata_json, {}) = ? LIMIT 1",
            json_path(FILENAME_KEY)
        );
        let row = sqlx::query(&sql)
            .bind(collection)
            .bind(filename)
            .fetch_optional(pool)
            .await
            .map_err(backend(op))?;
        match row {
            Some(row) => {
                let metadata_json: String = row.get("metadata_json");
                let metadata =
                    serde_json::from_str(&metadata_json).map_err(|e| Error::backend(op, e))?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    async fn create_metadata_index(&self, collection: &str, field: &str) -> Result<()> {
        let op = Operation::CreateMetadataIndex;
        validate_field(field)?;
        let pool = self.pool(op)?;

        let sql = format!(
            "CREATE INDEX IF NOT EXISTS \"idx_chunks_meta_{}\" ON chunks(collection, json_extract(metadata_json, {}))",
            field,
            json_path(field)
        );
        sqlx::query(&sql).execute(pool).await.map_err(backend(op))?;

        let result =
            sqlx::query("INSERT OR IGNORE INTO metadata_indexes (collection, field) VALUES (?, ?)")
                .bind(collection)
                .bind(field)
                .execute(pool)
                .await
                .map_err(backend(op))?;
        if result.rows_affected() > 0 {
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
        let op = Operation::Search;
        let pool = self.pool(op)?;

        let similarity = sqlx::query(
            "SELECT similarity FROM vector_indexes WHERE collection = ? ORDER BY name LIMIT 1",
        )
        .bind(collection)
        .fetch_optional(pool)
        .await
        .map_err(backend(op))?
        .map(|row| parse_similarity(row.get::<String, _>("similarity").as_str()))
        .unwrap_or_default();

        let (clauses, params) = compile_filter(filter)?;
        let sql = format!(
            "SELECT id, text, embedding, metadata_json FROM chunks WHERE collection = ?{}",
            clauses
        );
        let rows = bind_params(sqlx::query(&sql).bind(collection), &params)
            .fetch_all(pool)
            .await
            .map_err(backend(op))?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row, op)?;
            let score = similarity_score(similarity, query_vector, &record.embedding);
            scored.push((score, record));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        tracing::debug!(collection, %similarity, hits = scored.len(), "search complete");
        Ok(scored.into_iter().map(|(_, r)| r).collect())
    }
}
