//! # kbsync core
//!
//! Shared logic for kbsync: chunk identity, data models, the store
//! abstraction, collaborator traits, and the reconciliation engine.
//!
//! This crate contains no database driver and no async runtime. Concrete
//! stores, extractors, and embedders live in the `kbsync` app crate or in
//! callers' code.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod identity;
pub mod models;
pub mod observe;
pub mod reconcile;
pub mod store;

pub use error::{Error, Operation, Result};
pub use reconcile::{FileState, ReconciliationEngine, SyncOutcome};
pub use store::Store;
