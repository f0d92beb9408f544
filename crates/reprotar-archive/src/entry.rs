use crate::header::{CanonicalHeader, EntryKind};
use crate::registry::HeaderRegistry;
use crate::ArchiveError;
use reprotar_schema::EntryRules;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Size of the name and linkname fields of a tar header.
const NAME_FIELD_LEN: usize = 100;

/// What happened to one visited node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Written,
    /// An identical entry was already in the archive.
    Duplicate,
    Skipped,
}

/// Derive the canonical header for a node, or `None` if the node must not
/// appear in the archive (empty rewritten name, socket).
pub fn canonical_header(
    path: &Path,
    metadata: &Metadata,
    rules: &EntryRules,
) -> Result<Option<CanonicalHeader>, ArchiveError> {
    let link_target = if metadata.file_type().is_symlink() {
        let target = fs::read_link(path).map_err(|source| ArchiveError::ReadLink {
            path: path.to_path_buf(),
            source,
        })?;
        Some(target.into_os_string().into_vec())
    } else {
        None
    };

    let Some(kind) = EntryKind::from_metadata(metadata) else {
        warn!("skipping {}: sockets cannot be archived", path.display());
        return Ok(None);
    };

    let source = path.as_os_str().as_bytes();
    let name = rules.entry_name(source);
    if name.is_empty() {
        debug!("skipping {}: rewritten name is empty", path.display());
        return Ok(None);
    }

    let mut header = CanonicalHeader::new(name.into_owned(), kind, metadata.mode());
    if kind.has_payload() {
        header.size = metadata.len();
    }
    header.link_target = link_target;
    header.mode = rules.mode_for(source, header.mode);
    Ok(Some(header))
}

/// Serialize one visited node into the archive.
pub fn append_node<W: Write>(
    builder: &mut tar::Builder<W>,
    registry: &mut HeaderRegistry,
    path: &Path,
    metadata: &Metadata,
    rules: &EntryRules,
) -> Result<Appended, ArchiveError> {
    let Some(header) = canonical_header(path, metadata, rules)? else {
        return Ok(Appended::Skipped);
    };

    if !registry.admit(&header)? {
        debug!(
            "{} is already archived as '{}'",
            path.display(),
            header.name_lossy()
        );
        return Ok(Appended::Duplicate);
    }

    let written = if header.kind.has_payload() {
        let file = File::open(path).map_err(|source| ArchiveError::Payload {
            path: path.to_path_buf(),
            source,
        })?;
        write_entry(builder, &header, SizedReader::new(file, header.size))
    } else {
        write_entry(builder, &header, io::empty())
    };
    written.map_err(|err| match SourceError::take(err) {
        Ok(source) => ArchiveError::Payload {
            path: path.to_path_buf(),
            source,
        },
        Err(source) => ArchiveError::Write {
            name: header.name_lossy(),
            source,
        },
    })?;
    Ok(Appended::Written)
}

/// Write a header followed by its payload.
///
/// Names are stored byte-for-byte, absolute ones included. Values that do
/// not fit the 100-byte fields are preceded by GNU long-name / long-link
/// records, the same layout GNU tar produces.
fn write_entry<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    canonical: &CanonicalHeader,
    payload: R,
) -> io::Result<()> {
    let mut header = canonical.to_tar()?;

    if canonical.name.len() > NAME_FIELD_LEN {
        append_long_record(builder, tar::EntryType::GNULongName, &canonical.name)?;
    }
    fill_field(&mut header.as_old_mut().name, &canonical.name);

    if let Some(target) = &canonical.link_target {
        if target.len() > NAME_FIELD_LEN {
            append_long_record(builder, tar::EntryType::GNULongLink, target)?;
        }
        fill_field(&mut header.as_old_mut().linkname, target);
    }

    header.set_cksum();
    builder.append(&header, payload)
}

fn append_long_record<W: Write>(
    builder: &mut tar::Builder<W>,
    entry_type: tar::EntryType,
    value: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    fill_field(&mut header.as_old_mut().name, b"././@LongLink");
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    // GNU tar counts the trailing NUL
    header.set_size(value.len() as u64 + 1);
    header.set_entry_type(entry_type);
    header.set_cksum();
    builder.append(&header, value.chain(&[0u8][..]))
}

fn fill_field(field: &mut [u8], value: &[u8]) {
    let len = value.len().min(field.len());
    field.fill(0);
    field[..len].copy_from_slice(&value[..len]);
}

/// An error reading the source file, as opposed to writing the archive.
#[derive(Debug, Error)]
#[error(transparent)]
struct SourceError(io::Error);

impl SourceError {
    fn wrap(err: io::Error) -> io::Error {
        io::Error::new(err.kind(), SourceError(err))
    }

    /// Split a failed append into the source read error, or the untouched
    /// stream error.
    fn take(err: io::Error) -> Result<io::Error, io::Error> {
        if !err.get_ref().is_some_and(|inner| inner.is::<SourceError>()) {
            return Err(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<SourceError>()) {
            Some(Ok(source)) => Ok(source.0),
            Some(Err(other)) => Err(io::Error::other(other)),
            None => Err(io::Error::other("archive write failed")),
        }
    }
}

/// Reads exactly the size recorded in the header; a file that shrinks or
/// grows while it is being archived is an error rather than a corrupt entry.
///
/// Every error it returns is tagged as a [`SourceError`].
struct SizedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> SizedReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
        }
    }
}

impl<R: Read> SizedReader<R> {
    fn read_checked(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            let mut probe = [0u8; 1];
            return match self.inner.read(&mut probe)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "file grew while it was being archived",
                )),
            };
        }
        let limit = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..limit])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "file shrank while it was being archived ({} bytes missing)",
                    self.remaining
                ),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_checked(buf).map_err(SourceError::wrap)
    }
}
