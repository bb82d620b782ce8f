//! Observability sink injected into the engine.
//!
//! The engine never touches a global logger directly; it reports
//! [`SyncEvent`]s to the [`SyncObserver`] it was built with.
//! [`TracingObserver`] forwards them as `tracing` events, and tests can plug
//! in a recorder to assert on them.

use crate::error::Operation;
use crate::models::IngestReport;
use crate::reconcile::FileState;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Classified {
        filename: String,
        state: FileState,
    },
    /// The file could not be read; its fingerprint was derived from the path.
    /// Such a file keeps looking changed on every run.
    DegradedHash {
        path: String,
        reason: String,
    },
    ChunksDeleted {
        filename: String,
        count: u64,
    },
    ChunksIngested {
        filename: String,
        report: IngestReport,
    },
    /// Extraction yielded nothing; no chunks were written.
    EmptyExtraction {
        filename: String,
    },
    BackendFailure {
        filename: String,
        op: Operation,
        error: String,
    },
}

pub trait SyncObserver: Send + Sync {
    fn observe(&self, event: &SyncEvent);
}

/// Emits every event through `tracing`, under the `kbsync::sync` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn observe(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Classified { filename, state } => {
                tracing::info!(target: "kbsync::sync", %filename, ?state, "classified file");
            }
            SyncEvent::DegradedHash { path, reason } => {
                tracing::warn!(
                    target: "kbsync::sync",
                    %path,
                    %reason,
                    "file unreadable, fingerprinting path instead of content"
                );
            }
            SyncEvent::ChunksDeleted { filename, count } => {
                tracing::info!(target: "kbsync::sync", %filename, count, "deleted chunks");
            }
            SyncEvent::ChunksIngested { filename, report } => {
                tracing::info!(
                    target: "kbsync::sync",
                    %filename,
                    batches = report.batches,
                    matched = report.matched,
                    modified = report.modified,
                    inserted = report.inserted,
                    "ingested chunks"
                );
            }
            SyncEvent::EmptyExtraction { filename } => {
                tracing::warn!(target: "kbsync::sync", %filename, "extraction produced no chunks");
            }
            SyncEvent::BackendFailure {
                filename,
                op,
                error,
            } => {
                tracing::error!(target: "kbsync::sync", %filename, %op, %error, "store operation failed");
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {
    fn observe(&self, _event: &SyncEvent) {}
}
