//! File reconciliation: decide what a file needs and apply it.
//!
//! Each [`ReconciliationEngine::process_file`] call fingerprints the file,
//! reads the stored [`FileSummary`], classifies the pair into a
//! [`FileState`], and runs the matching write protocol:
//!
//! | State | Protocol |
//! |-------|----------|
//! | `New` | extract → embed → upsert |
//! | `Legacy` | delete by filename → extract → embed → upsert |
//! | `ContentChanged` | delete by filename → extract → embed → upsert |
//! | `MetadataChanged` | extract → embed → upsert (same ids, metadata overwritten) |
//! | `Unchanged` | nothing |
//!
//! Chunk ids come from text and filename only, so the metadata path lands
//! on the ids already stored and never needs a delete.
//!
//! Every write is an upsert or a filtered delete, so re-running after any
//! failure is safe: the next call reclassifies from whatever the store holds.
//! A failed upsert is undone before the error is returned. A metadata-only
//! update puts the previous metadata back on the same ids; any other ingest
//! deletes the file's chunks, so a half-written file comes back as `New`
//! rather than `Unchanged`. If that cleanup fails too, the returned error
//! says so.
//!
//! The engine holds no per-file state. Calls for different filenames may
//! run concurrently; calls for the same filename must be serialized by the
//! caller.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::identity::IdScheme;
use crate::models::{
    ChunkRecord, FileSummary, Filter, IngestReport, Metadata, VectorIndexConfig, FILENAME_KEY,
    FILE_HASH_KEY,
};
use crate::observe::{SyncEvent, SyncObserver, TracingObserver};
use crate::store::Store;

/// Classification of an incoming file against stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Nothing stored under this filename.
    New,
    /// Stored chunks predate fingerprinting (no `file_hash`).
    Legacy,
    ContentChanged,
    MetadataChanged,
    Unchanged,
}

/// Write protocol selected for a [`FileState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Ingest,
    Reingest,
    UpdateMetadata,
    Skip,
}

impl FileState {
    pub fn action(self) -> SyncAction {
        match self {
            FileState::New => SyncAction::Ingest,
            FileState::Legacy | FileState::ContentChanged => SyncAction::Reingest,
            FileState::MetadataChanged => SyncAction::UpdateMetadata,
            FileState::Unchanged => SyncAction::Skip,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileState::New => "new",
            FileState::Legacy => "legacy",
            FileState::ContentChanged => "content_changed",
            FileState::MetadataChanged => "metadata_changed",
            FileState::Unchanged => "unchanged",
        }
    }
}

/// Classify a file. Evaluated in order: new, legacy, content, metadata.
pub fn classify(
    existing: Option<&FileSummary>,
    current_hash: &str,
    incoming: &Metadata,
) -> FileState {
    let Some(existing) = existing else {
        return FileState::New;
    };
    match existing.file_hash() {
        None => FileState::Legacy,
        Some(stored) if stored != current_hash => FileState::ContentChanged,
        Some(_) if existing.metadata_differs(incoming) => FileState::MetadataChanged,
        Some(_) => FileState::Unchanged,
    }
}

/// Content fingerprint of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: String,
    /// Set when the file could not be read and the path was hashed instead.
    pub degraded: Option<String>,
}

impl Fingerprint {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// SHA-256 of the file's bytes, or of its path string when unreadable.
///
/// Blocking; the engine goes through [`Extractor::hash_file`] instead.
pub fn fingerprint_file(path: &Path) -> Fingerprint {
    fingerprint_from(path, hash_file(path))
}

fn fingerprint_from(path: &Path, hashed: io::Result<String>) -> Fingerprint {
    match hashed {
        Ok(hash) => Fingerprint {
            hash,
            degraded: None,
        },
        Err(e) => {
            let mut hasher = Sha256::new();
            hasher.update(path.to_string_lossy().as_bytes());
            Fingerprint {
                hash: format!("{:x}", hasher.finalize()),
                degraded: Some(e.to_string()),
            }
        }
    }
}

/// Hex SHA-256 of the file's bytes. Blocking.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Result of one [`ReconciliationEngine::process_file`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub filename: String,
    pub state: FileState,
    pub file_hash: String,
    pub degraded_hash: bool,
    pub chunks_deleted: u64,
    pub chunks_written: usize,
    pub report: IngestReport,
}

/// Per-file synchronization against a [`Store`].
pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    extractor: Arc<dyn Extractor>,
    embedder: Arc<dyn Embedder>,
    observer: Arc<dyn SyncObserver>,
    collection: String,
    id_scheme: IdScheme,
}

impl ReconciliationEngine {
    /// The store must already be connected.
    pub fn new(
        store: Arc<dyn Store>,
        extractor: Arc<dyn Extractor>,
        embedder: Arc<dyn Embedder>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            extractor,
            embedder,
            observer: Arc::new(TracingObserver),
            collection: collection.into(),
            id_scheme: IdScheme::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_id_scheme(mut self, id_scheme: IdScheme) -> Self {
        self.id_scheme = id_scheme;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Create the collection, its vector index, and the `filename` lookup
    /// index. Returns whether the vector index validates afterwards.
    pub async fn ensure_indexes(&self, index: &VectorIndexConfig) -> Result<bool> {
        self.store.create_collection(&self.collection).await?;
        self.store
            .create_vector_index(&self.collection, index)
            .await?;
        self.store
            .create_metadata_index(&self.collection, FILENAME_KEY)
            .await?;
        Ok(self.store.validate_index(&self.collection, &index.name).await)
    }

    /// Bring the stored chunks of one file in line with `path` and `metadata`.
    ///
    /// `metadata` must carry a non-empty string `filename`. Any `file_hash`
    /// it carries is replaced by the computed fingerprint.
    pub async fn process_file(&self, path: &Path, metadata: Metadata) -> Result<SyncOutcome> {
        let filename = require_filename(&metadata)?;

        let fingerprint = fingerprint_from(path, self.extractor.hash_file(path).await);
        if let Some(reason) = &fingerprint.degraded {
            self.observer.observe(&SyncEvent::DegradedHash {
                path: path.display().to_string(),
                reason: reason.clone(),
            });
        }

        let existing = self
            .guard(&filename, self.store.get_file_info(&self.collection, &filename))
            .await?
            .map(FileSummary::new);

        let state = classify(existing.as_ref(), &fingerprint.hash, &metadata);
        self.observer.observe(&SyncEvent::Classified {
            filename: filename.clone(),
            state,
        });

        let mut outcome = SyncOutcome {
            filename: filename.clone(),
            state,
            file_hash: fingerprint.hash.clone(),
            degraded_hash: fingerprint.is_degraded(),
            chunks_deleted: 0,
            chunks_written: 0,
            report: IngestReport::default(),
        };

        match state.action() {
            SyncAction::Skip => {}
            SyncAction::Ingest => {
                let (written, report) = self
                    .ingest(path, &filename, metadata, &fingerprint.hash, None)
                    .await?;
                outcome.chunks_written = written;
                outcome.report = report;
            }
            SyncAction::UpdateMetadata => {
                let previous = existing.as_ref().map(FileSummary::metadata);
                let (written, report) = self
                    .ingest(path, &filename, metadata, &fingerprint.hash, previous)
                    .await?;
                outcome.chunks_written = written;
                outcome.report = report;
            }
            SyncAction::Reingest => {
                outcome.chunks_deleted = self.delete_file(&filename).await?;
                let (written, report) = self
                    .ingest(path, &filename, metadata, &fingerprint.hash, None)
                    .await?;
                outcome.chunks_written = written;
                outcome.report = report;
            }
        }

        Ok(outcome)
    }

    /// Remove every chunk of `filename`, whatever its stored state.
    pub async fn delete_file(&self, filename: &str) -> Result<u64> {
        let count = self
            .guard(
                filename,
                self.store
                    .delete_chunks(&self.collection, &Filter::filename(filename)),
            )
            .await?;
        self.observer.observe(&SyncEvent::ChunksDeleted {
            filename: filename.to_string(),
            count,
        });
        Ok(count)
    }

    /// Stored metadata of `filename`, if any chunk of it exists.
    pub async fn file_info(&self, filename: &str) -> Result<Option<FileSummary>> {
        Ok(self
            .store
            .get_file_info(&self.collection, filename)
            .await?
            .map(FileSummary::new))
    }

    /// Embed `query` and return the nearest stored chunks.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ChunkRecord>> {
        let vector = self.embed_checked(query).await?;
        self.store
            .search(&self.collection, &vector, limit, filter)
            .await
    }

    /// Extract, embed, and upsert every chunk of the file.
    ///
    /// `previous` is the stored metadata on the metadata-only path; a failed
    /// upsert restores it instead of deleting the file's chunks.
    async fn ingest(
        &self,
        path: &Path,
        filename: &str,
        mut metadata: Metadata,
        file_hash: &str,
        previous: Option<&Metadata>,
    ) -> Result<(usize, IngestReport)> {
        let texts = self
            .extractor
            .extract(path)
            .await
            .map_err(|source| Error::Extraction {
                path: path.display().to_string(),
                source,
            })?;

        if texts.is_empty() {
            self.observer.observe(&SyncEvent::EmptyExtraction {
                filename: filename.to_string(),
            });
            return Ok((0, IngestReport::default()));
        }

        metadata.insert(FILE_HASH_KEY.to_string(), Value::String(file_hash.to_string()));

        let mut seen = HashSet::with_capacity(texts.len());
        let mut records = Vec::with_capacity(texts.len());
        for text in texts {
            let id = self.id_scheme.chunk_id(&text, filename);
            // Repeated text within a file lands on one id.
            if !seen.insert(id.clone()) {
                continue;
            }
            let embedding = self.embed_checked(&text).await?;
            records.push(ChunkRecord::new(id, text, embedding, metadata.clone()));
        }

        let report = match self
            .guard(
                filename,
                self.store.ingest_chunks(&self.collection, &records),
            )
            .await
        {
            Ok(report) => report,
            Err(e) => return Err(self.undo_ingest(filename, &records, previous, e).await),
        };
        self.observer.observe(&SyncEvent::ChunksIngested {
            filename: filename.to_string(),
            report,
        });
        Ok((records.len(), report))
    }

    /// Roll back a failed upsert and return the error to report.
    ///
    /// Committed batches already carry the new hash; left in place they
    /// would classify as unchanged and the rest would never land.
    async fn undo_ingest(
        &self,
        filename: &str,
        records: &[ChunkRecord],
        previous: Option<&Metadata>,
        error: Error,
    ) -> Error {
        let cleanup = match previous {
            Some(metadata) => {
                let restored: Vec<ChunkRecord> = records
                    .iter()
                    .map(|r| {
                        ChunkRecord::new(
                            r.id.clone(),
                            r.text.clone(),
                            r.embedding.clone(),
                            metadata.clone(),
                        )
                    })
                    .collect();
                self.guard(
                    filename,
                    self.store.ingest_chunks(&self.collection, &restored),
                )
                .await
                .map(|_| ())
            }
            None => self.delete_file(filename).await.map(|_| ()),
        };
        match cleanup {
            Ok(()) => error,
            Err(cleanup) => error.with_cleanup_failure(filename, &cleanup),
        }
    }

    async fn embed_checked(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.embedder.embed(text).await.map_err(Error::Embedding)?;
        let dims = self.embedder.dims();
        if dims > 0 && vector.len() != dims {
            return Err(Error::Embedding(anyhow::anyhow!(
                "model '{}' returned {} dimensions, expected {}",
                self.embedder.model_name(),
                vector.len(),
                dims
            )));
        }
        Ok(vector)
    }

    /// Await a store call, reporting a backend failure before propagating it.
    async fn guard<T>(
        &self,
        filename: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        call.await.map_err(|e| {
            if let Some(op) = e.operation() {
                self.observer.observe(&SyncEvent::BackendFailure {
                    filename: filename.to_string(),
                    op,
                    error: e.to_string(),
                });
            }
            e
        })
    }
}

fn require_filename(metadata: &Metadata) -> Result<String> {
    match metadata.get(FILENAME_KEY) {
        Some(Value::String(name)) if !name.is_empty() => Ok(name.clone()),
        Some(_) => Err(Error::Validation(
            "metadata 'filename' must be a non-empty string".to_string(),
        )),
        None => Err(Error::Validation(
            "metadata must contain 'filename'".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    fn summary(value: Value) -> FileSummary {
        FileSummary::new(meta(value))
    }

    #[test]
    fn test_classify_new() {
        assert_eq!(
            classify(None, "h1", &meta(json!({"filename": "a"}))),
            FileState::New
        );
    }

    #[test]
    fn test_classify_legacy_beats_hash_comparison() {
        let existing = summary(json!({"filename": "a", "label": "x"}));
        assert_eq!(
            classify(Some(&existing), "h1", &meta(json!({"filename": "a", "label": "x"}))),
            FileState::Legacy
        );
    }

    #[test]
    fn test_classify_content_changed_masks_metadata() {
        let existing = summary(json!({"filename": "a", "file_hash": "h0", "label": "x"}));
        assert_eq!(
            classify(Some(&existing), "h1", &meta(json!({"filename": "a", "label": "y"}))),
            FileState::ContentChanged
        );
    }

    #[test]
    fn test_classify_metadata_changed() {
        let existing = summary(json!({"filename": "a", "file_hash": "h1", "label": "x"}));
        assert_eq!(
            classify(Some(&existing), "h1", &meta(json!({"filename": "a", "label": "y"}))),
            FileState::MetadataChanged
        );
    }

    #[test]
    fn test_classify_unchanged_ignores_incoming_hash() {
        let existing = summary(json!({"filename": "a", "file_hash": "h1", "label": "x"}));
        let incoming = meta(json!({"filename": "a", "label": "x", "file_hash": "stale"}));
        assert_eq!(classify(Some(&existing), "h1", &incoming), FileState::Unchanged);
    }

    #[test]
    fn test_actions() {
        assert_eq!(FileState::New.action(), SyncAction::Ingest);
        assert_eq!(FileState::Legacy.action(), SyncAction::Reingest);
        assert_eq!(FileState::ContentChanged.action(), SyncAction::Reingest);
        assert_eq!(FileState::MetadataChanged.action(), SyncAction::UpdateMetadata);
        assert_eq!(FileState::Unchanged.action(), SyncAction::Skip);
    }

    #[test]
    fn test_fingerprint_reads_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let fp = fingerprint_file(file.path());
        assert!(!fp.is_degraded());
        assert_eq!(
            fp.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_fingerprint_degrades_to_path() {
        let path = Path::new("/definitely/not/here.pdf");
        let a = fingerprint_file(path);
        let b = fingerprint_file(path);
        assert!(a.is_degraded());
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, fingerprint_file(Path::new("/definitely/not/there.pdf")).hash);
    }

    #[test]
    fn test_require_filename() {
        assert!(matches!(
            require_filename(&meta(json!({"label": "x"}))),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            require_filename(&meta(json!({"filename": ""}))),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            require_filename(&meta(json!({"filename": 7}))),
            Err(Error::Validation(_))
        ));
        assert_eq!(require_filename(&meta(json!({"filename": "a"}))).unwrap(), "a");
    }
}
