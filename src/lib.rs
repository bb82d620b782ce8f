//! # kbsync
//!
//! Incremental synchronization of document files into a vector store.
//!
//! Each file is fingerprinted and compared against what the store already
//! holds for its `filename`; only new, changed, or re-labelled files are
//! extracted, embedded, and written. Chunk ids are derived from chunk text
//! and filename, so re-running a sync is idempotent.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────┐   ┌──────────┐
//! │   Files    │──▶│ ReconciliationEngine │──▶│  SQLite  │
//! │ walk+globs │   │ classify → write     │   │  Store   │
//! └────────────┘   └──────────┬───────────┘   └──────────┘
//!                             │
//!                  ┌──────────┴──────────┐
//!                  ▼                     ▼
//!            ┌───────────┐        ┌───────────┐
//!            │ Extractor │        │ Embedder  │
//!            │ text/PDF  │        │ hash/HTTP │
//!            └───────────┘        └───────────┘
//! ```
//!
//! The engine, store trait, and data model live in `kbsync-core`; this
//! crate supplies the SQLite store, the file extractor, the embedders,
//! per-filename locking, and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite [`Store`](kbsync_core::Store) implementation |
//! | [`extract`] | Text and PDF extraction |
//! | [`embedding`] | Embedder implementations |
//! | [`file_lock`] | Per-filename serialization |
//! | [`sync`] | Directory scan and concurrent reconciliation |

pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod file_lock;
pub mod migrate;
pub mod sqlite_store;
pub mod sync;
