//! Deterministic, streaming tar archives for content-addressable image layers.
//!
//! `tar_paths` walks an ordered list of root paths on a producer thread and
//! exposes the canonical archive as a `Read` stream fed through a bounded
//! pipe. Every entry is normalized (root ownership, epoch timestamps,
//! rewritten names, overridden modes) and checked against the entries already
//! emitted, so the archive is a pure function of its inputs. `tar_paths_sum`
//! and `tar_paths_write` consume the stream to produce a `LayerDigest`.

pub mod archive;
pub mod digest;
pub mod entry;
pub mod header;
pub mod layer;
pub mod pipe;
pub mod registry;

pub use archive::{tar_paths, tar_paths_with, ArchiveStream, BuildOptions};
pub use digest::{Digest, DigestAlgorithm, DigestError, Digester, HashingWriter};
pub use entry::canonical_header;
pub use header::{CanonicalHeader, EntryKind};
pub use layer::{
    tar_paths_sum, tar_paths_sum_with, tar_paths_write, tar_paths_write_with, LayerDigest,
};
pub use registry::HeaderRegistry;

use reprotar_schema::SchemaError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid path options: {0}")]
    Schema(#[from] SchemaError),
    #[error("failed accessing path '{}': {source}", .path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read symlink '{}': {source}", .path.display())]
    ReadLink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "the entry '{name}' overrides an entry with different attributes (previous: {previous}, current: {current})"
    )]
    Conflict {
        name: String,
        previous: Box<CanonicalHeader>,
        current: Box<CanonicalHeader>,
    },
    #[error("failed to copy '{}' into the archive: {source}", .path.display())]
    Payload {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write '{name}' to the archive stream: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to start archive producer: {0}")]
    Spawn(#[source] io::Error),
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    /// Recover the producer's error from a failed read on an [`ArchiveStream`].
    ///
    /// Errors raised while building travel through the pipe wrapped in an
    /// `io::Error`; anything else (destination file, hash sink) stays `Io`.
    pub fn from_stream(err: io::Error) -> Self {
        let from_producer = err
            .get_ref()
            .is_some_and(|inner| inner.is::<ArchiveError>());
        if !from_producer {
            return Self::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<ArchiveError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Self::Io(io::Error::other(other)),
            None => Self::Io(io::Error::other("archive stream failed")),
        }
    }
}
