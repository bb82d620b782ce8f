//! Directory synchronization.
//!
//! Walks a root directory, keeps the files matching the include globs and
//! none of the exclude globs, and reconciles each one through a
//! [`LockedEngine`]. Files run concurrently up to `sync.concurrency`; each
//! file's `filename` is its path relative to the root, with `/` separators.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use kbsync_core::models::{Metadata, FILENAME_KEY};
use kbsync_core::{FileState, ReconciliationEngine};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::config::{Config, SyncConfig};
use crate::embedding::create_embedder;
use crate::extract::FileExtractor;
use crate::file_lock::LockedEngine;
use crate::sqlite_store::SqliteStore;
use kbsync_core::store::Store;

/// A file selected for synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the scan root, used as the stored `filename`.
    pub filename: String,
}

/// Per-run totals.
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub files: usize,
    pub states: BTreeMap<&'static str, usize>,
    pub chunks_written: usize,
    pub chunks_deleted: u64,
    pub degraded: usize,
    pub failed: Vec<(String, String)>,
}

impl SyncSummary {
    pub fn count(&self, state: FileState) -> usize {
        self.states.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// Connect the configured SQLite store and build an engine over it.
pub async fn connect_engine(config: &Config) -> Result<(Arc<SqliteStore>, ReconciliationEngine)> {
    let store = Arc::new(SqliteStore::with_batch_size(
        &config.db.path,
        config.store.batch_size,
    ));
    store.connect().await?;

    let extractor = Arc::new(FileExtractor::new(config.chunking.max_tokens));
    let embedder = create_embedder(&config.embedding, config.embedding_dims())?;
    let engine = ReconciliationEngine::new(
        store.clone(),
        extractor,
        embedder,
        config.store.collection.clone(),
    )
    .with_id_scheme(config.sync.id_scheme);

    Ok((store, engine))
}

pub fn scan_files(config: &SyncConfig, root: &Path) -> Result<Vec<ScannedFile>> {
    if !root.exists() {
        bail!("Sync root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(filename) = relative_filename(path, root) else {
            continue;
        };

        if exclude_set.is_match(&filename) || !include_set.is_match(&filename) {
            continue;
        }

        files.push(ScannedFile {
            path: path.to_path_buf(),
            filename,
        });
    }

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

/// `path` relative to `root` with `/` separators; `None` outside `root`.
pub fn relative_filename(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let filename = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!filename.is_empty()).then_some(filename)
}

/// Stored filename for a single file: its path under the sync root when it
/// lives there, so it matches what `sync` stores, otherwise its file name.
pub fn filename_for(path: &Path, root: Option<&Path>) -> Option<String> {
    if let Some(root) = root {
        let abs_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let abs_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        if let Some(filename) = relative_filename(&abs_path, &abs_root) {
            return Some(filename);
        }
    }
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

/// `base` plus the file's `filename`.
pub fn file_metadata(base: &Metadata, filename: &str) -> Metadata {
    let mut metadata = base.clone();
    metadata.insert(FILENAME_KEY.to_string(), Value::String(filename.to_string()));
    metadata
}

/// Reconcile every file, at most `concurrency` at a time.
///
/// Failures are collected per file; the run continues past them.
pub async fn sync_files(
    engine: &LockedEngine,
    files: Vec<ScannedFile>,
    base: &Metadata,
    concurrency: usize,
) -> SyncSummary {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut summary = SyncSummary {
        files: files.len(),
        ..SyncSummary::default()
    };

    for file in files {
        let engine = engine.clone();
        let semaphore = Arc::clone(&semaphore);
        let metadata = file_metadata(base, &file.filename);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = engine.process_file(&file.path, metadata).await;
            (file.filename, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(outcome))) => {
                *summary.states.entry(outcome.state.as_str()).or_insert(0) += 1;
                summary.chunks_written += outcome.chunks_written;
                summary.chunks_deleted += outcome.chunks_deleted;
                if outcome.degraded_hash {
                    summary.degraded += 1;
                }
            }
            Ok((filename, Err(e))) => {
                tracing::error!(%filename, error = %e, "file sync failed");
                summary.failed.push((filename, e.to_string()));
            }
            Err(e) => {
                tracing::error!(error = %e, "sync task panicked");
                summary.failed.push(("<task>".to_string(), e.to_string()));
            }
        }
    }

    summary.failed.sort();
    summary
}

pub async fn run_sync(config: &Config, root_override: Option<PathBuf>) -> Result<SyncSummary> {
    let root = root_override
        .or_else(|| config.sync.root.clone())
        .ok_or_else(|| anyhow::anyhow!("No sync root: set [sync].root or pass --root"))?;

    let files = scan_files(&config.sync, &root)?;
    let (store, engine) = connect_engine(config).await?;
    let engine = LockedEngine::new(engine);

    let summary = sync_files(&engine, files, &config.sync.metadata, config.sync.concurrency).await;

    println!("sync {}", root.display());
    println!("  files: {}", summary.files);
    for state in [
        FileState::New,
        FileState::Legacy,
        FileState::ContentChanged,
        FileState::MetadataChanged,
        FileState::Unchanged,
    ] {
        println!("  {}: {}", state.as_str(), summary.count(state));
    }
    println!("  chunks written: {}", summary.chunks_written);
    println!("  chunks deleted: {}", summary.chunks_deleted);
    if summary.degraded > 0 {
        println!("  degraded hashes: {}", summary.degraded);
    }
    for (filename, error) in &summary.failed {
        println!("  failed: {}: {}", filename, error);
    }
    if summary.failed.is_empty() {
        println!("ok");
    }

    store.close().await;
    Ok(summary)
}
