use crate::SchemaError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One root of a layer: a filesystem path plus the options applied to every
/// node found beneath it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathSpec {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<PathOptions>,
}

impl PathSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: PathOptions) -> Self {
        self.options = Some(options);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PathOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<Rewrite>,
    /// `null` is accepted as an empty list.
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub perms: Vec<PermRule>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Maps the full source path to an archive entry name.
///
/// `repl` uses the regex crate's expansion syntax (`$1`, `${name}`). An empty
/// `regex` is treated as no rewrite at all.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Rewrite {
    pub regex: String,
    #[serde(default)]
    pub repl: String,
}

/// Overrides the mode of every node whose source path matches `regex`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PermRule {
    pub regex: String,
    pub mode: String,
}

impl PermRule {
    pub fn new(regex: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            mode: mode.into(),
        }
    }
}

impl Rewrite {
    pub fn new(regex: impl Into<String>, repl: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            repl: repl.into(),
        }
    }
}

pub fn parse_paths_str(input: &str) -> Result<Vec<PathSpec>, SchemaError> {
    Ok(serde_json::from_str(input)?)
}

pub fn parse_paths_file(path: impl AsRef<Path>) -> Result<Vec<PathSpec>, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_paths_str(&content)
}
