//! Extractor trait: turns a file into ordered text chunks.

use std::io;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// Segments a file into text chunks.
///
/// Called exactly once per full ingest with the file's current content.
/// Segmentation need not be deterministic, although id stability across
/// metadata-only updates relies on it being so in practice.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<Vec<String>>;

    /// Hex SHA-256 of the file's bytes, used as its content fingerprint.
    ///
    /// The default hashes on the calling thread. Implementations running on
    /// an async runtime should move the read off the executor.
    async fn hash_file(&self, path: &Path) -> io::Result<String> {
        crate::reconcile::hash_file(path)
    }
}
