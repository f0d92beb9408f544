use crate::paths::PathOptions;
use crate::SchemaError;
use regex::bytes::Regex;
use std::borrow::Cow;

/// Highest mode a permission override may set (permission bits plus
/// setuid, setgid and sticky).
const MAX_MODE: u32 = 0o7777;

/// Validated, ready-to-apply form of [`PathOptions`].
///
/// Patterns operate on raw path bytes so that non-UTF-8 file names are
/// rewritten and matched exactly like any other name.
#[derive(Debug, Clone, Default)]
pub struct EntryRules {
    rewrite: Option<CompiledRewrite>,
    perms: Vec<CompiledPerm>,
}

#[derive(Debug, Clone)]
struct CompiledRewrite {
    regex: Regex,
    repl: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CompiledPerm {
    regex: Regex,
    mode: u32,
}

impl EntryRules {
    /// Compile the options of one root. `None` yields identity rules.
    pub fn compile(options: Option<&PathOptions>) -> Result<Self, SchemaError> {
        let Some(options) = options else {
            return Ok(Self::default());
        };

        let rewrite = match &options.rewrite {
            Some(rw) if !rw.regex.is_empty() => Some(CompiledRewrite {
                regex: compile_pattern(&rw.regex)?,
                repl: rw.repl.as_bytes().to_vec(),
            }),
            _ => None,
        };

        let perms = options
            .perms
            .iter()
            .map(|rule| {
                Ok(CompiledPerm {
                    regex: compile_pattern(&rule.regex)?,
                    mode: parse_mode(&rule.mode)?,
                })
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;

        Ok(Self { rewrite, perms })
    }

    /// Archive entry name for a source path. An empty result means the node
    /// must not appear in the archive.
    pub fn entry_name<'p>(&self, path: &'p [u8]) -> Cow<'p, [u8]> {
        match &self.rewrite {
            Some(rw) => rw.regex.replace_all(path, rw.repl.as_slice()),
            None => Cow::Borrowed(path),
        }
    }

    /// Mode after applying every matching permission rule in order; the last
    /// match wins.
    pub fn mode_for(&self, path: &[u8], mode: u32) -> u32 {
        self.perms
            .iter()
            .rev()
            .find(|rule| rule.regex.is_match(path))
            .map_or(mode, |rule| rule.mode)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, SchemaError> {
    Regex::new(pattern).map_err(|source| SchemaError::InvalidPattern {
        pattern: pattern.to_owned(),
        source,
    })
}

/// Parse an octal permission string such as `"644"`, `"0755"` or `"0o4755"`.
pub fn parse_mode(mode: &str) -> Result<u32, SchemaError> {
    let trimmed = mode.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return Err(SchemaError::InvalidMode(mode.to_owned()));
    }
    match u32::from_str_radix(digits, 8) {
        Ok(value) if value <= MAX_MODE => Ok(value),
        _ => Err(SchemaError::InvalidMode(mode.to_owned())),
    }
}
