//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/kb.sqlite"
//!
//! [store]
//! collection = "handbook"
//!
//! [index]
//! dimensions = 64
//! similarity = "cosine"
//!
//! [embedding]
//! provider = "hash"
//! dims = 64
//!
//! [sync]
//! root = "./docs"
//! include_globs = ["**/*.md", "**/*.pdf"]
//!
//! [sync.metadata]
//! provider = "internal"
//! ```

use anyhow::{bail, Context, Result};
use kbsync_core::identity::IdScheme;
use kbsync_core::models::{Metadata, Similarity, VectorIndexConfig};
use kbsync_core::store::DEFAULT_BATCH_SIZE;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub store: StoreConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub collection: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_name")]
    pub name: String,
    pub dimensions: usize,
    #[serde(default = "default_index_path")]
    pub path: String,
    #[serde(default)]
    pub similarity: Similarity,
    #[serde(default = "default_candidate_count")]
    pub candidate_count: usize,
}

fn default_index_name() -> String {
    "vector_index".to_string()
}
fn default_index_path() -> String {
    "embedding".to_string()
}
fn default_candidate_count() -> usize {
    100
}

impl IndexConfig {
    pub fn to_vector_index(&self) -> VectorIndexConfig {
        VectorIndexConfig {
            name: self.name.clone(),
            dimensions: self.dimensions,
            path: self.path.clone(),
            similarity: self.similarity,
            candidate_count: self.candidate_count,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_max_tokens() -> usize {
    700
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub id_scheme: IdScheme,
    /// Merged into every file's metadata before reconciliation.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            concurrency: default_concurrency(),
            id_scheme: IdScheme::default(),
            metadata: Metadata::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}
fn default_concurrency() -> usize {
    4
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.store.collection.trim().is_empty() {
        bail!("store.collection must not be empty");
    }
    if config.store.batch_size == 0 {
        bail!("store.batch_size must be > 0");
    }

    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.index.dimensions == 0 {
        bail!("index.dimensions must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }
    if let Some(dims) = config.embedding.dims {
        if dims != config.index.dimensions {
            bail!(
                "embedding.dims ({}) must equal index.dimensions ({})",
                dims,
                config.index.dimensions
            );
        }
    }
    if config.embedding.provider != "hash" && config.embedding.model.is_none() {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    if config.sync.concurrency == 0 {
        bail!("sync.concurrency must be > 0");
    }

    Ok(config)
}

impl Config {
    /// Embedding width: `embedding.dims` when set, otherwise the index width.
    pub fn embedding_dims(&self) -> usize {
        self.embedding.dims.unwrap_or(self.index.dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/kb.sqlite"

[store]
collection = "handbook"

[index]
dimensions = 16
"#;

    #[test]
    fn test_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.store.batch_size, 100);
        assert_eq!(cfg.index.name, "vector_index");
        assert_eq!(cfg.index.path, "embedding");
        assert_eq!(cfg.index.similarity, Similarity::Cosine);
        assert_eq!(cfg.index.candidate_count, 100);
        assert_eq!(cfg.chunking.max_tokens, 700);
        assert_eq!(cfg.embedding.provider, "hash");
        assert_eq!(cfg.embedding_dims(), 16);
        assert_eq!(cfg.sync.concurrency, 4);
        assert_eq!(cfg.sync.id_scheme, IdScheme::PerFile);
        assert!(cfg.sync.metadata.is_empty());
    }

    #[test]
    fn test_full() {
        let cfg = parse_config(&format!(
            "{}\n{}",
            MINIMAL.replace("dimensions = 16", "dimensions = 16\nsimilarity = \"dotProduct\""),
            r#"
[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 16

[sync]
root = "./docs"
concurrency = 2
id_scheme = "content"

[sync.metadata]
provider = "internal"
"#
        ))
        .unwrap();
        assert_eq!(cfg.index.similarity, Similarity::DotProduct);
        assert_eq!(cfg.sync.id_scheme, IdScheme::Content);
        assert_eq!(cfg.sync.metadata["provider"], "internal");
        assert_eq!(cfg.sync.root, Some(PathBuf::from("./docs")));
    }

    #[test]
    fn test_rejects_invalid() {
        let cases = [
            ("batch_size", MINIMAL.replace("collection = \"handbook\"", "collection = \"handbook\"\nbatch_size = 0")),
            ("collection", MINIMAL.replace("\"handbook\"", "\"  \"")),
            ("dimensions", MINIMAL.replace("dimensions = 16", "dimensions = 0")),
            ("max_tokens", format!("{}\n[chunking]\nmax_tokens = 0\n", MINIMAL)),
            ("provider", format!("{}\n[embedding]\nprovider = \"magic\"\n", MINIMAL)),
            ("dims", format!("{}\n[embedding]\ndims = 8\n", MINIMAL)),
            ("model", format!("{}\n[embedding]\nprovider = \"openai\"\n", MINIMAL)),
            ("concurrency", format!("{}\n[sync]\nconcurrency = 0\n", MINIMAL)),
        ];
        for (name, content) in cases {
            assert!(parse_config(&content).is_err(), "{} should be rejected", name);
        }
    }
}
