use crate::digest::DigestAlgorithm;
use crate::entry::{append_node, Appended};
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::registry::HeaderRegistry;
use crate::ArchiveError;
use reprotar_schema::{EntryRules, PathSpec, SchemaError};
use std::io::{self, BufWriter, Read, Write};
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};
use walkdir::WalkDir;

const PRODUCER_THREAD_NAME: &str = "reprotar-producer";

/// Tuning and output options for one archive build.
///
/// Buffering parameters only affect memory use and throughput; the archive
/// bytes are identical for any values.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub algorithm: DigestAlgorithm,
    /// Chunks that may be in flight between producer and reader.
    pub pipe_depth: usize,
    /// Bytes the producer buffers before handing a chunk to the pipe.
    pub chunk_size: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            algorithm: DigestAlgorithm::default(),
            pipe_depth: 16,
            chunk_size: 64 * 1024,
        }
    }
}

struct Root {
    path: PathBuf,
    rules: EntryRules,
}

/// Read end of an archive being produced on a background thread.
///
/// Single pass: once consumed (or failed) it cannot be restarted; build a new
/// one from the same paths instead. Dropping it stops the producer.
pub struct ArchiveStream {
    reader: PipeReader,
    producer: Option<JoinHandle<()>>,
}

impl Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        self.reader.close();
        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
    }
}

pub fn tar_paths(paths: &[PathSpec]) -> Result<ArchiveStream, ArchiveError> {
    tar_paths_with(paths, &BuildOptions::default())
}

/// Start building the archive of `paths` and return its byte stream.
///
/// Options are validated before the producer starts. Errors found while
/// walking are returned by the stream's `read`; use
/// [`ArchiveError::from_stream`] to get the typed error back.
pub fn tar_paths_with(
    paths: &[PathSpec],
    options: &BuildOptions,
) -> Result<ArchiveStream, ArchiveError> {
    let roots = paths
        .iter()
        .map(|spec| {
            Ok(Root {
                path: spec.path.clone(),
                rules: EntryRules::compile(spec.options.as_ref())?,
            })
        })
        .collect::<Result<Vec<_>, SchemaError>>()?;

    info!("building archive from {} root path(s)", roots.len());

    let (writer, reader) = pipe(options.pipe_depth);
    let chunk_size = options.chunk_size;
    let producer = thread::Builder::new()
        .name(PRODUCER_THREAD_NAME.to_owned())
        .spawn(move || produce(&roots, writer, chunk_size))
        .map_err(ArchiveError::Spawn)?;

    Ok(ArchiveStream {
        reader,
        producer: Some(producer),
    })
}

fn produce(roots: &[Root], writer: PipeWriter, chunk_size: usize) {
    let mut builder = tar::Builder::new(BufWriter::with_capacity(chunk_size, writer));
    let mut registry = HeaderRegistry::new();

    let result = write_roots(&mut builder, &mut registry, roots).and_then(|()| {
        builder.finish()?;
        builder.get_mut().flush()?;
        Ok(())
    });

    let out = builder.get_mut().get_mut();
    match result {
        Ok(()) => {
            debug!("archive complete: {} entries", registry.len());
            if let Err(e) = out.close() {
                debug!("archive reader went away before the end of the stream: {e}");
            }
        }
        Err(err) => {
            debug!("archive build failed: {err}");
            out.close_with_error(err);
        }
    }
}

fn write_roots<W: Write>(
    builder: &mut tar::Builder<W>,
    registry: &mut HeaderRegistry,
    roots: &[Root],
) -> Result<(), ArchiveError> {
    for root in roots {
        let mut written = 0usize;
        let walker = WalkDir::new(&root.path)
            .follow_links(false)
            .follow_root_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|err| access_error(err, &root.path))?;
            let metadata = entry
                .metadata()
                .map_err(|err| access_error(err, entry.path()))?;
            // the root keeps its spelling; nodes below it are named by their
            // cleaned path, so `./a` and `a/` roots both yield `a/x`
            let path = if entry.depth() == 0 {
                Cow::Borrowed(entry.path())
            } else {
                Cow::Owned(clean_path(entry.path()))
            };
            if append_node(builder, registry, &path, &metadata, &root.rules)?
                == Appended::Written
            {
                written += 1;
            }
        }
        debug!("archived {} ({written} new entries)", root.path.display());
    }
    Ok(())
}

/// Lexically normalize a path: drop `.` components and redundant
/// separators, and resolve `..` against the preceding component.
fn clean_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                Some(Component::ParentDir | Component::CurDir) | None => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

fn access_error(err: walkdir::Error, fallback: &Path) -> ArchiveError {
    let path = err.path().unwrap_or(fallback).to_path_buf();
    let source = match err.into_io_error() {
        Some(io_err) => io_err,
        None => io::Error::other("filesystem loop detected"),
    };
    ArchiveError::Access { path, source }
}
