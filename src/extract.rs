//! File text extraction.
//!
//! [`FileExtractor`] reads a file from disk, turns it into plain UTF-8 text
//! (PDFs through `pdf-extract`, everything else as UTF-8), then segments it
//! with [`chunk_text`].

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kbsync_core::chunk::chunk_text;
use kbsync_core::extract::Extractor;

/// Document formats the extractor understands, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Text,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("pdf") => FileKind::Pdf,
            _ => FileKind::Text,
        }
    }
}

/// Default [`Extractor`]: PDF or plain text, chunked on paragraph boundaries.
#[derive(Debug, Clone)]
pub struct FileExtractor {
    max_tokens: usize,
}

impl FileExtractor {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

/// Extract plain text from a file's bytes.
pub fn extract_text(bytes: Vec<u8>, kind: FileKind) -> Result<String> {
    match kind {
        FileKind::Pdf => {
            pdf_extract::extract_text_from_mem(&bytes).context("PDF extraction failed")
        }
        FileKind::Text => String::from_utf8(bytes).context("file is not valid UTF-8"),
    }
}

#[async_trait]
impl Extractor for FileExtractor {
    async fn extract(&self, path: &Path) -> Result<Vec<String>> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let kind = FileKind::from_path(path);
        let max_tokens = self.max_tokens;

        // PDF parsing is CPU-bound.
        let chunks = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let text = extract_text(bytes, kind)?;
            Ok(chunk_text(&text, max_tokens))
        })
        .await??;

        tracing::debug!(path = %path.display(), ?kind, chunks = chunks.len(), "extracted file");
        Ok(chunks)
    }

    async fn hash_file(&self, path: &Path) -> io::Result<String> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || kbsync_core::reconcile::hash_file(&path))
            .await
            .map_err(io::Error::other)?
    }
}
