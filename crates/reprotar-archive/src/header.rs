use std::fmt;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};

/// Owner and group name written into every entry.
pub const ROOT_NAME: &str = "root";

/// Timestamp written into every entry (Unix epoch, UTC).
pub const EPOCH: u64 = 0;

/// Bits of `st_mode` that survive into the archive: permissions plus
/// setuid, setgid and sticky.
const MODE_MASK: u32 = 0o7777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
    Fifo,
}

impl EntryKind {
    /// Classify lstat metadata. Sockets have no tar representation.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let ft = metadata.file_type();
        let kind = if ft.is_file() {
            Self::Regular
        } else if ft.is_dir() {
            Self::Directory
        } else if ft.is_symlink() {
            Self::Symlink
        } else if ft.is_char_device() {
            let (major, minor) = device_numbers(metadata.rdev());
            Self::CharDevice { major, minor }
        } else if ft.is_block_device() {
            let (major, minor) = device_numbers(metadata.rdev());
            Self::BlockDevice { major, minor }
        } else if ft.is_fifo() {
            Self::Fifo
        } else {
            return None;
        };
        Some(kind)
    }

    fn tar_type(self) -> tar::EntryType {
        match self {
            Self::Regular => tar::EntryType::Regular,
            Self::Directory => tar::EntryType::Directory,
            Self::Symlink => tar::EntryType::Symlink,
            Self::CharDevice { .. } => tar::EntryType::Char,
            Self::BlockDevice { .. } => tar::EntryType::Block,
            Self::Fifo => tar::EntryType::Fifo,
        }
    }

    /// Whether the entry carries file content after its header.
    pub fn has_payload(self) -> bool {
        self == Self::Regular
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regular => f.write_str("regular"),
            Self::Directory => f.write_str("directory"),
            Self::Symlink => f.write_str("symlink"),
            Self::CharDevice { major, minor } => write!(f, "char device {major}:{minor}"),
            Self::BlockDevice { major, minor } => write!(f, "block device {major}:{minor}"),
            Self::Fifo => f.write_str("fifo"),
        }
    }
}

fn device_numbers(rdev: u64) -> (u32, u32) {
    (libc::major(rdev), libc::minor(rdev))
}

/// Normalized metadata of one archive entry.
///
/// Two headers are interchangeable only if every field is equal; the
/// registry relies on this to tell harmless duplicates from conflicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalHeader {
    pub name: Vec<u8>,
    pub kind: EntryKind,
    pub link_target: Option<Vec<u8>>,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
}

impl CanonicalHeader {
    /// A header owned by root:root with epoch timestamps and no payload.
    pub fn new(name: Vec<u8>, kind: EntryKind, mode: u32) -> Self {
        Self {
            name,
            kind,
            link_target: None,
            size: 0,
            mode: mode & MODE_MASK,
            uid: 0,
            gid: 0,
            uname: ROOT_NAME.to_owned(),
            gname: ROOT_NAME.to_owned(),
            mtime: EPOCH,
            atime: EPOCH,
            ctime: EPOCH,
        }
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Build the GNU tar header for this entry. Name and link fields are
    /// left for the writer, which handles values longer than the header
    /// can hold.
    pub(crate) fn to_tar(&self) -> io::Result<tar::Header> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(self.kind.tar_type());
        header.set_size(self.size);
        header.set_mode(self.mode);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        header.set_username(&self.uname)?;
        header.set_groupname(&self.gname)?;
        header.set_mtime(self.mtime);
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(self.atime);
            gnu.set_ctime(self.ctime);
        }
        match self.kind {
            EntryKind::CharDevice { major, minor } | EntryKind::BlockDevice { major, minor } => {
                header.set_device_major(major)?;
                header.set_device_minor(minor)?;
            }
            _ => {}
        }
        Ok(header)
    }
}

impl fmt::Display for CanonicalHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{name {:?}, {}, mode {:04o}, size {}, owner {}:{} ({}:{}), mtime {}, atime {}, ctime {}",
            self.name_lossy(),
            self.kind,
            self.mode,
            self.size,
            self.uid,
            self.gid,
            self.uname,
            self.gname,
            self.mtime,
            self.atime,
            self.ctime,
        )?;
        if let Some(target) = &self.link_target {
            write!(f, ", link {:?}", String::from_utf8_lossy(target))?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn new_header_is_normalized() {
        let h = CanonicalHeader::new(b"bin/sh".to_vec(), EntryKind::Regular, 0o100_755);
        assert_eq!(h.mode, 0o755);
        assert_eq!((h.uid, h.gid), (0, 0));
        assert_eq!(h.uname, "root");
        assert_eq!(h.gname, "root");
        assert_eq!((h.mtime, h.atime, h.ctime), (0, 0, 0));
    }

    #[test]
    fn special_bits_are_kept() {
        let h = CanonicalHeader::new(b"bin/su".to_vec(), EntryKind::Regular, 0o104_755);
        assert_eq!(h.mode, 0o4755);
    }

    #[test]
    fn classify_regular_dir_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        std::os::unix::fs::symlink("f", dir.path().join("l")).unwrap();

        let meta = |p: &std::path::Path| fs::symlink_metadata(p).unwrap();
        assert_eq!(EntryKind::from_metadata(&meta(&file)), Some(EntryKind::Regular));
        assert_eq!(
            EntryKind::from_metadata(&meta(dir.path())),
            Some(EntryKind::Directory)
        );
        assert_eq!(
            EntryKind::from_metadata(&meta(&dir.path().join("l"))),
            Some(EntryKind::Symlink)
        );
    }

    #[test]
    fn socket_is_not_representable() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("s.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&sock).unwrap();
        let meta = fs::symlink_metadata(&sock).unwrap();
        assert_eq!(EntryKind::from_metadata(&meta), None);
    }

    #[test]
    fn to_tar_zeroes_all_timestamps() {
        let h = CanonicalHeader::new(b"etc".to_vec(), EntryKind::Directory, 0o755);
        let tar_header = h.to_tar().unwrap();
        assert_eq!(tar_header.mtime().unwrap(), 0);
        let gnu = tar_header.as_gnu().unwrap();
        assert_eq!(gnu.atime().unwrap(), 0);
        assert_eq!(gnu.ctime().unwrap(), 0);
        assert_eq!(tar_header.username().unwrap(), Some("root"));
        assert_eq!(tar_header.groupname().unwrap(), Some("root"));
        assert_eq!(tar_header.entry_type(), tar::EntryType::Directory);
    }

    #[test]
    fn display_includes_link_target() {
        let mut h = CanonicalHeader::new(b"lib/libc.so".to_vec(), EntryKind::Symlink, 0o777);
        h.link_target = Some(b"libc.so.6".to_vec());
        let shown = h.to_string();
        assert!(shown.contains("symlink"));
        assert!(shown.contains("libc.so.6"));
        assert!(shown.contains("mode 0777"));
    }
}
