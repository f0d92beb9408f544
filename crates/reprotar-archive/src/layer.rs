use crate::archive::{tar_paths_with, BuildOptions};
use crate::digest::{Digest, HashingWriter};
use crate::{fsync_dir, ArchiveError};
use reprotar_schema::PathSpec;
use serde::{Deserialize, Serialize};
use std::io::{self, BufWriter};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

/// Digest and size of a built archive, as referenced by a layer descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDigest {
    pub digest: Digest,
    pub size: u64,
}

/// Digest and size of the archive of `paths`, without keeping its bytes.
pub fn tar_paths_sum(paths: &[PathSpec]) -> Result<LayerDigest, ArchiveError> {
    tar_paths_sum_with(paths, &BuildOptions::default())
}

pub fn tar_paths_sum_with(
    paths: &[PathSpec],
    options: &BuildOptions,
) -> Result<LayerDigest, ArchiveError> {
    let mut stream = tar_paths_with(paths, options)?;
    let mut sink = HashingWriter::new(io::sink(), options.algorithm);
    io::copy(&mut stream, &mut sink).map_err(ArchiveError::from_stream)?;
    let (_, digest, size) = sink.finish();
    info!("archive digest {digest} ({size} bytes)");
    Ok(LayerDigest { digest, size })
}

/// Write the archive of `paths` to `dest` and return its digest and size.
///
/// Bytes are hashed and written in the same pass. The file is staged next
/// to `dest` and only renamed into place once the archive is complete, so a
/// failed build leaves nothing at `dest`.
pub fn tar_paths_write(paths: &[PathSpec], dest: &Path) -> Result<LayerDigest, ArchiveError> {
    tar_paths_write_with(paths, dest, &BuildOptions::default())
}

pub fn tar_paths_write_with(
    paths: &[PathSpec],
    dest: &Path,
    options: &BuildOptions,
) -> Result<LayerDigest, ArchiveError> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut stream = tar_paths_with(paths, options)?;
    let tmp = NamedTempFile::new_in(dir)?;
    let mut tee = HashingWriter::new(BufWriter::new(tmp), options.algorithm);
    io::copy(&mut stream, &mut tee).map_err(ArchiveError::from_stream)?;

    let (file, digest, size) = tee.finish();
    let tmp = file.into_inner().map_err(io::IntoInnerError::into_error)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| ArchiveError::Io(e.error))?;
    fsync_dir(dir)?;

    info!("wrote {} with digest {digest} ({size} bytes)", dest.display());
    Ok(LayerDigest { digest, size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestAlgorithm;
    use std::fs;

    #[test]
    fn sum_of_empty_list() {
        let result = tar_paths_sum(&[]).unwrap();
        assert_eq!(result.size, 1024);
        assert_eq!(
            result.digest,
            Digest::of(DigestAlgorithm::Sha256, &[0u8; 1024])
        );
    }

    #[test]
    fn write_matches_sum() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("data"), "layer content").unwrap();
        let paths = [PathSpec::new(src.path())];

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("layer.tar");
        let written = tar_paths_write(&paths, &dest).unwrap();
        let summed = tar_paths_sum(&paths).unwrap();
        assert_eq!(written, summed);

        let bytes = fs::read(&dest).unwrap();
        assert_eq!(bytes.len() as u64, written.size);
        assert_eq!(Digest::of(DigestAlgorithm::Sha256, &bytes), written.digest);
    }

    #[test]
    fn failed_write_leaves_no_file() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("layer.tar");

        let err = tar_paths_write(&[PathSpec::new(src.path().join("missing"))], &dest)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Access { .. }));
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn layer_digest_serializes_for_descriptors() {
        let layer = LayerDigest {
            digest: Digest::of(DigestAlgorithm::Sha256, b""),
            size: 0,
        };
        let json = serde_json::to_value(&layer).unwrap();
        assert_eq!(
            json["digest"],
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(json["size"], 0);
    }
}
