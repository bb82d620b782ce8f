//! Content-addressed chunk identity.
//!
//! A chunk id is the SHA-256 of its text, optionally followed by a salt and
//! a canonical rendering of its metadata:
//!
//! ```text
//! text [ "|" salt ] [ "|" canonical_json(metadata) ]
//! ```
//!
//! The salt is normally the owning filename, so identical paragraphs in two
//! files get two ids. Metadata is left out of the digest by default, which is
//! what lets a metadata edit overwrite chunks in place instead of minting new
//! ids.
//!
//! # Example
//!
//! ```rust
//! use kbsync_core::identity::generate_id;
//!
//! let a = generate_id("Common Text Paragraph", "a.pdf", None, false);
//! let b = generate_id("Common Text Paragraph", "b.pdf", None, false);
//! assert_ne!(a, b);
//! assert_eq!(a.len(), 64);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::Metadata;

/// How chunk ids are salted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdScheme {
    /// Salt with the owning filename. Identical text in two files is stored twice.
    #[default]
    PerFile,
    /// No salt. Identical text anywhere in the collection shares one id.
    Content,
}

impl IdScheme {
    /// Id for `text` belonging to `filename` under this scheme.
    pub fn chunk_id(self, text: &str, filename: &str) -> String {
        match self {
            IdScheme::PerFile => generate_id(text, filename, None, false),
            IdScheme::Content => generate_id(text, "", None, false),
        }
    }
}

/// Derive a deterministic hex id from chunk text, a salt, and optionally metadata.
///
/// An empty `salt` is skipped. `metadata` only participates when
/// `include_metadata` is set, and is rendered with sorted keys so insertion
/// order never changes the result.
pub fn generate_id(
    text: &str,
    salt: &str,
    metadata: Option<&Metadata>,
    include_metadata: bool,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    if !salt.is_empty() {
        hasher.update(b"|");
        hasher.update(salt.as_bytes());
    }
    if include_metadata {
        if let Some(meta) = metadata {
            hasher.update(b"|");
            hasher.update(canonical_json(&Value::Object(meta.clone())).as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Serialize a JSON value with object keys sorted at every depth.
///
/// Does not rely on `serde_json::Map` ordering, which flips to insertion
/// order when any crate in the build enables `preserve_order`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
