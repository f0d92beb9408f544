use crate::header::CanonicalHeader;
use crate::ArchiveError;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Headers already emitted during one build, keyed by entry name.
///
/// Owned by the producer thread and passed down the walk by `&mut`; it only
/// ever grows.
#[derive(Debug, Default)]
pub struct HeaderRegistry {
    seen: HashMap<Vec<u8>, CanonicalHeader>,
}

impl HeaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `header`. Returns `true` if it must be written, `false` if an
    /// identical entry was already emitted, and a conflict error if an entry
    /// with the same name but different attributes exists.
    pub fn admit(&mut self, header: &CanonicalHeader) -> Result<bool, ArchiveError> {
        match self.seen.entry(header.name.clone()) {
            Entry::Occupied(existing) if existing.get() == header => Ok(false),
            Entry::Occupied(existing) => Err(ArchiveError::Conflict {
                name: header.name_lossy(),
                previous: Box::new(existing.get().clone()),
                current: Box::new(header.clone()),
            }),
            Entry::Vacant(slot) => {
                slot.insert(header.clone());
                Ok(true)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::EntryKind;

    fn file(name: &str, size: u64) -> CanonicalHeader {
        let mut h = CanonicalHeader::new(name.as_bytes().to_vec(), EntryKind::Regular, 0o644);
        h.size = size;
        h
    }

    #[test]
    fn first_definition_is_admitted() {
        let mut reg = HeaderRegistry::new();
        assert!(reg.admit(&file("a/x", 2)).unwrap());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn identical_redefinition_is_skipped() {
        let mut reg = HeaderRegistry::new();
        reg.admit(&file("a/x", 2)).unwrap();
        assert!(!reg.admit(&file("a/x", 2)).unwrap());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn different_redefinition_conflicts() {
        let mut reg = HeaderRegistry::new();
        reg.admit(&file("a/x", 2)).unwrap();
        let err = reg.admit(&file("a/x", 3)).unwrap_err();
        match err {
            ArchiveError::Conflict {
                name,
                previous,
                current,
            } => {
                assert_eq!(name, "a/x");
                assert_eq!(previous.size, 2);
                assert_eq!(current.size, 3);
            }
            other => panic!("expected conflict, got {other}"),
        }
    }

    #[test]
    fn mode_difference_conflicts() {
        let mut reg = HeaderRegistry::new();
        reg.admit(&file("bin/sh", 0)).unwrap();
        let mut exec = file("bin/sh", 0);
        exec.mode = 0o755;
        assert!(reg.admit(&exec).is_err());
    }

    #[test]
    fn kind_difference_conflicts() {
        let mut reg = HeaderRegistry::new();
        reg.admit(&CanonicalHeader::new(b"lib".to_vec(), EntryKind::Directory, 0o755))
            .unwrap();
        let mut link = CanonicalHeader::new(b"lib".to_vec(), EntryKind::Symlink, 0o755);
        link.link_target = Some(b"lib64".to_vec());
        assert!(reg.admit(&link).is_err());
    }
}
