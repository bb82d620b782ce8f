use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A store capability, used to tag backend failures and call counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Connect,
    CreateCollection,
    CreateVectorIndex,
    ValidateIndex,
    IngestChunks,
    DeleteChunks,
    UpdateChunkMetadata,
    GetChunk,
    GetFileInfo,
    CreateMetadataIndex,
    Search,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::CreateCollection => "create_collection",
            Operation::CreateVectorIndex => "create_vector_index",
            Operation::ValidateIndex => "validate_index",
            Operation::IngestChunks => "ingest_chunks",
            Operation::DeleteChunks => "delete_chunks",
            Operation::UpdateChunkMetadata => "update_chunk_metadata",
            Operation::GetChunk => "get_chunk",
            Operation::GetFileInfo => "get_file_info",
            Operation::CreateMetadataIndex => "create_metadata_index",
            Operation::Search => "search",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Caller input is malformed (e.g. metadata without `filename`).
    #[error("validation error: {0}")]
    Validation(String),

    /// The store is unreachable or `connect()` has not been called.
    #[error("connection error: {0}")]
    Connection(String),

    /// A store operation failed after the store was ready.
    #[error("{op} failed: {source}")]
    Backend {
        op: Operation,
        #[source]
        source: anyhow::Error,
    },

    #[error("extraction failed for '{path}': {source}")]
    Extraction {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("embedding failed: {0}")]
    Embedding(#[source] anyhow::Error),
}

impl Error {
    pub fn backend(op: Operation, source: impl Into<anyhow::Error>) -> Self {
        Error::Backend {
            op,
            source: source.into(),
        }
    }

    /// Append the failure of a follow-up cleanup for `filename`.
    pub fn with_cleanup_failure(self, filename: &str, cleanup: &Error) -> Self {
        let note = format!("cleanup of '{}' also failed: {}", filename, cleanup);
        match self {
            Error::Validation(msg) => Error::Validation(format!("{}; {}", msg, note)),
            Error::Connection(msg) => Error::Connection(format!("{}; {}", msg, note)),
            Error::Backend { op, source } => {
                let message = format!("{}; {}", source, note);
                Error::Backend {
                    op,
                    source: source.context(message),
                }
            }
            Error::Extraction { path, source } => {
                let message = format!("{}; {}", source, note);
                Error::Extraction {
                    path,
                    source: source.context(message),
                }
            }
            Error::Embedding(source) => {
                let message = format!("{}; {}", source, note);
                Error::Embedding(source.context(message))
            }
        }
    }

    /// The failed store operation, when this is a backend error.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Error::Backend { op, .. } => Some(*op),
            _ => None,
        }
    }
}
