//! Per-filename serialization.
//!
//! The reconciliation engine is correct only when calls for the same
//! filename do not interleave. [`FileLocks`] hands out one async mutex per
//! filename; [`LockedEngine`] wraps an engine so every `process_file` and
//! `delete_file` runs under its filename's lock. Different filenames proceed
//! in parallel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use kbsync_core::models::{Metadata, FILENAME_KEY};
use kbsync_core::{ReconciliationEngine, Result, SyncOutcome};
use tokio::sync::OwnedMutexGuard;

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Keyed async mutexes. Entries are dropped once nobody holds or awaits them.
#[derive(Clone, Default)]
pub struct FileLocks {
    locks: LockMap,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `filename`.
    pub async fn lock(&self, filename: &str) -> FileGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(filename.to_string()).or_default())
        };
        let guard = mutex.lock_owned().await;
        FileGuard {
            filename: filename.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of filenames currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one filename, released on drop.
pub struct FileGuard {
    filename: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl FileGuard {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        // Release first so the map entry's count reflects only waiters.
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.filename)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.filename);
        }
    }
}

/// A [`ReconciliationEngine`] whose per-file operations are serialized by
/// filename.
#[derive(Clone)]
pub struct LockedEngine {
    engine: Arc<ReconciliationEngine>,
    locks: FileLocks,
}

impl LockedEngine {
    pub fn new(engine: ReconciliationEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            locks: FileLocks::new(),
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub async fn process_file(&self, path: &Path, metadata: Metadata) -> Result<SyncOutcome> {
        // Without a usable filename the engine rejects the call before any
        // store access, so there is nothing to serialize.
        let filename = metadata
            .get(FILENAME_KEY)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let _guard = match &filename {
            Some(name) => Some(self.locks.lock(name).await),
            None => None,
        };
        self.engine.process_file(path, metadata).await
    }

    pub async fn delete_file(&self, filename: &str) -> Result<u64> {
        let _guard = self.locks.lock(filename).await;
        self.engine.delete_file(filename).await
    }
}
