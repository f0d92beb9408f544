//! Path lists, per-path options, and compiled entry rules for reprotar.
//!
//! This crate defines the input layer: the ordered `PathSpec` list handed over
//! by closure resolution (parsed from JSON with `parse_paths_str` /
//! `parse_paths_file`), the raw `PathOptions` attached to each root, and
//! `EntryRules`, the validated form with compiled regexes and numeric modes
//! that the archive builder applies to every visited node.

pub mod paths;
pub mod rules;

pub use paths::{parse_paths_file, parse_paths_str, PathOptions, PathSpec, PermRule, Rewrite};
pub use rules::{parse_mode, EntryRules};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read path list: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse path list: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid permission mode '{0}', expected an octal value up to 7777")]
    InvalidMode(String),
}
