//! Data models shared by the engine and every store.
//!
//! A [`ChunkRecord`] is the unit of storage. Files are not stored on their
//! own: a file's state is the metadata carried by any one of its chunks,
//! read back as a [`FileSummary`].

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form chunk metadata. Always carries `filename`, and `file_hash`
/// once the file has been ingested under the hashing scheme.
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key holding the owning file's natural key.
pub const FILENAME_KEY: &str = "filename";
/// Metadata key holding the content fingerprint of the owning file.
pub const FILE_HASH_KEY: &str = "file_hash";

/// A stored chunk: content-derived id, text, embedding, metadata.
///
/// Writing a record whose `id` already exists replaces the stored text,
/// embedding, and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ChunkRecord {
    pub fn new(id: String, text: String, embedding: Vec<f32>, metadata: Metadata) -> Self {
        Self {
            id,
            text,
            embedding,
            metadata,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get(FILENAME_KEY).and_then(Value::as_str)
    }

    pub fn file_hash(&self) -> Option<&str> {
        self.metadata.get(FILE_HASH_KEY).and_then(Value::as_str)
    }
}

/// File-level view over the metadata of one stored chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSummary {
    metadata: Metadata,
}

impl FileSummary {
    pub fn new(metadata: Metadata) -> Self {
        Self { metadata }
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get(FILENAME_KEY).and_then(Value::as_str)
    }

    /// Stored fingerprint; `None` for legacy records.
    ///
    /// A `file_hash` that is present but empty or not a string is treated
    /// as missing.
    pub fn file_hash(&self) -> Option<&str> {
        self.metadata
            .get(FILE_HASH_KEY)
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
    }

    /// Whether any key of `incoming` other than `file_hash` holds a value
    /// different from the stored one. Keys only present in the store are
    /// not considered.
    pub fn metadata_differs(&self, incoming: &Metadata) -> bool {
        incoming
            .iter()
            .filter(|(k, _)| k.as_str() != FILE_HASH_KEY)
            .any(|(k, v)| self.metadata.get(k) != Some(v))
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> Metadata {
        self.metadata
    }
}

/// Vector similarity used by an index and by search scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Similarity {
    #[default]
    Cosine,
    Euclidean,
    #[serde(alias = "dot_product")]
    DotProduct,
}

impl Similarity {
    pub fn as_str(self) -> &'static str {
        match self {
            Similarity::Cosine => "cosine",
            Similarity::Euclidean => "euclidean",
            Similarity::DotProduct => "dotProduct",
        }
    }
}

impl fmt::Display for Similarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vector index definition, forwarded verbatim to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    pub name: String,
    pub dimensions: usize,
    #[serde(default = "default_index_path")]
    pub path: String,
    #[serde(default)]
    pub similarity: Similarity,
    #[serde(default = "default_candidate_count")]
    pub candidate_count: usize,
}

fn default_index_path() -> String {
    "embedding".to_string()
}

fn default_candidate_count() -> usize {
    100
}

impl VectorIndexConfig {
    pub fn new(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            dimensions,
            path: default_index_path(),
            similarity: Similarity::default(),
            candidate_count: default_candidate_count(),
        }
    }
}

/// Equality conditions over top-level metadata fields, all of which must hold.
///
/// An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: BTreeMap<String, Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All chunks owned by `filename`.
    pub fn filename(filename: &str) -> Self {
        Self::new().eq(FILENAME_KEY, filename)
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(field.into(), value.into());
        self
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.conditions
            .iter()
            .all(|(field, value)| metadata.get(field).is_some_and(|v| values_equal(v, value)))
    }
}

/// JSON equality, except that numbers compare by value (`3 == 3.0`).
fn values_equal(stored: &Value, wanted: &Value) -> bool {
    match (stored, wanted) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => stored == wanted,
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Aggregate counts from an upsert run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub batches: usize,
    /// Records whose id already existed.
    pub matched: u64,
    /// Matched records whose stored content actually changed.
    pub modified: u64,
    /// Records whose id was new.
    pub inserted: u64,
}

impl IngestReport {
    pub fn written(&self) -> u64 {
        self.matched + self.inserted
    }
}

impl AddAssign for IngestReport {
    fn add_assign(&mut self, rhs: Self) {
        self.batches += rhs.batches;
        self.matched += rhs.matched;
        self.modified += rhs.modified;
        self.inserted += rhs.inserted;
    }
}
