//! # kbsync CLI
//!
//! ```bash
//! kbsync --config ./config/kbsync.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbsync init` | Create the collection and its indexes |
//! | `kbsync add <file>` | Reconcile one file |
//! | `kbsync sync` | Reconcile every matching file under the sync root |
//! | `kbsync delete <filename>` | Remove every chunk of a file |
//! | `kbsync info <filename>` | Print a file's stored metadata |
//! | `kbsync search "<query>"` | Vector search over stored chunks |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (e.g. `RUST_LOG=kbsync=debug`).

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use kbsync::config::{self, Config};
use kbsync::file_lock::LockedEngine;
use kbsync::sync::{self as file_sync, connect_engine, file_metadata, filename_for};
use kbsync_core::models::Filter;
use serde_json::Value;

/// kbsync: keep a vector store in step with a directory of documents.
#[derive(Parser)]
#[command(name = "kbsync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the collection, vector index, and filename index.
    ///
    /// Idempotent.
    Init,

    /// Reconcile a single file against the store.
    Add {
        /// Path to the file.
        file: PathBuf,

        /// Stored filename. Defaults to the path under `[sync].root` when
        /// the file lives there, otherwise the file's name.
        #[arg(long)]
        filename: Option<String>,

        /// Extra metadata as `key=value`. Values that parse as JSON
        /// (numbers, booleans) are stored typed.
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Reconcile every matching file under the sync root.
    Sync {
        /// Override `[sync].root`.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Delete every chunk stored for a filename.
    Delete { filename: String },

    /// Print the stored metadata of a filename as JSON.
    Info { filename: String },

    /// Search stored chunks by vector similarity.
    Search {
        query: String,

        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Metadata equality filter as `key=value`.
        #[arg(long = "where", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,
    },
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_meta_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

async fn run_init(cfg: &Config) -> Result<()> {
    let (store, engine) = connect_engine(cfg).await?;
    let valid = engine.ensure_indexes(&cfg.index.to_vector_index()).await?;
    store.close().await;
    if !valid {
        bail!("vector index '{}' did not validate", cfg.index.name);
    }
    println!(
        "Collection '{}' initialized (index '{}', {} dims, {}).",
        cfg.store.collection, cfg.index.name, cfg.index.dimensions, cfg.index.similarity
    );
    Ok(())
}

async fn run_add(
    cfg: &Config,
    file: PathBuf,
    filename: Option<String>,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let filename = match filename {
        Some(name) => name,
        None => filename_for(&file, cfg.sync.root.as_deref())
            .ok_or_else(|| anyhow::anyhow!("cannot derive a filename from {}", file.display()))?,
    };
    let mut metadata = file_metadata(&cfg.sync.metadata, &filename);
    for (key, value) in meta {
        metadata.insert(key, parse_meta_value(&value));
    }

    let (store, engine) = connect_engine(cfg).await?;
    let engine = LockedEngine::new(engine);
    let result = engine.process_file(&file, metadata).await;
    store.close().await;
    let outcome = result?;

    println!("add {}", outcome.filename);
    println!("  state: {}", outcome.state.as_str());
    println!("  file hash: {}", outcome.file_hash);
    if outcome.degraded_hash {
        println!("  warning: file unreadable, hash derived from path");
    }
    println!("  chunks deleted: {}", outcome.chunks_deleted);
    println!("  chunks written: {}", outcome.chunks_written);
    println!("ok");
    Ok(())
}

async fn run_delete(cfg: &Config, filename: &str) -> Result<()> {
    let (store, engine) = connect_engine(cfg).await?;
    let result = LockedEngine::new(engine).delete_file(filename).await;
    store.close().await;
    println!("deleted {} chunks for {}", result?, filename);
    Ok(())
}

async fn run_info(cfg: &Config, filename: &str) -> Result<()> {
    let (store, engine) = connect_engine(cfg).await?;
    let result = engine.file_info(filename).await;
    store.close().await;
    match result? {
        Some(summary) => {
            println!("{}", serde_json::to_string_pretty(summary.metadata())?);
            Ok(())
        }
        None => bail!("No chunks stored for '{}'", filename),
    }
}

async fn run_search(
    cfg: &Config,
    query: &str,
    limit: usize,
    filters: Vec<(String, String)>,
) -> Result<()> {
    let filter = filters
        .into_iter()
        .fold(Filter::new(), |f, (k, v)| f.eq(k, parse_meta_value(&v)));
    let filter = (!filter.is_empty()).then_some(filter);

    let (store, engine) = connect_engine(cfg).await?;
    let result = engine.search(query, limit, filter.as_ref()).await;
    store.close().await;
    let hits = result?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        let snippet: String = hit.text.chars().take(160).collect();
        println!(
            "{}. {} [{}]",
            i + 1,
            hit.filename().unwrap_or("<unknown>"),
            &hit.id[..12.min(hit.id.len())]
        );
        println!("    {}", snippet.replace('\n', " "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Add {
            file,
            filename,
            meta,
        } => run_add(&cfg, file, filename, meta).await?,
        Commands::Sync { root } => {
            let summary = file_sync::run_sync(&cfg, root).await?;
            if !summary.failed.is_empty() {
                bail!("{} file(s) failed to sync", summary.failed.len());
            }
        }
        Commands::Delete { filename } => run_delete(&cfg, &filename).await?,
        Commands::Info { filename } => run_info(&cfg, &filename).await?,
        Commands::Search {
            query,
            limit,
            filters,
        } => run_search(&cfg, &query, limit, filters).await?,
    }

    Ok(())
}
