//! Inode numbers for remote paths.
//!
//! The kernel addresses everything by inode; the remote store only knows
//! paths. Numbers are handed out on first lookup and kept until the kernel
//! forgets them, so a number always names the same path (following renames).

use crate::path::HdfsPath;
use std::collections::HashMap;

pub type InodeId = u64;
pub const ROOT_INODE: InodeId = 1;

#[derive(Debug, Clone)]
struct InodeEntry {
    path: HdfsPath,
    lookup_count: u64,
}

pub struct InodeTable {
    entries: HashMap<InodeId, InodeEntry>,
    by_path: HashMap<HdfsPath, InodeId>,
    next_ino: InodeId,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            entries: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INODE + 1,
        };
        table.entries.insert(
            ROOT_INODE,
            InodeEntry {
                path: HdfsPath::root(),
                lookup_count: 1,
            },
        );
        table.by_path.insert(HdfsPath::root(), ROOT_INODE);
        table
    }

    pub fn path(&self, ino: InodeId) -> Option<&HdfsPath> {
        self.entries.get(&ino).map(|e| &e.path)
    }

    pub fn ino(&self, path: &HdfsPath) -> Option<InodeId> {
        self.by_path.get(path).copied()
    }

    /// Inode for `path`, allocating one if needed, with one more kernel
    /// reference. Every successful lookup-like reply must go through here.
    pub fn lookup(&mut self, path: &HdfsPath) -> InodeId {
        if let Some(ino) = self.by_path.get(path).copied() {
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.lookup_count += 1;
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.entries.insert(
            ino,
            InodeEntry {
                path: path.clone(),
                lookup_count: 1,
            },
        );
        self.by_path.insert(path.clone(), ino);
        tracing::trace!("allocated inode {} for {}", ino, path);
        ino
    }

    /// Inode for `path` without taking a kernel reference (readdir entries).
    pub fn peek_or_assign(&mut self, path: &HdfsPath) -> InodeId {
        match self.by_path.get(path) {
            Some(ino) => *ino,
            None => {
                let ino = self.lookup(path);
                if let Some(entry) = self.entries.get_mut(&ino) {
                    entry.lookup_count = 0;
                }
                ino
            }
        }
    }

    /// Drops `nlookup` kernel references. The root is never forgotten.
    pub fn forget(&mut self, ino: InodeId, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let remove = match self.entries.get_mut(&ino) {
            Some(entry) => {
                entry.lookup_count = entry.lookup_count.saturating_sub(nlookup);
                entry.lookup_count == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = self.entries.remove(&ino) {
                if self.by_path.get(&entry.path) == Some(&ino) {
                    self.by_path.remove(&entry.path);
                }
            }
        }
    }

    /// Detaches the path of a deleted entry so a later create under the same
    /// name gets a fresh inode. The old number stays valid until forgotten.
    pub fn unlink(&mut self, path: &HdfsPath) {
        self.by_path.remove(path);
    }

    /// Moves `from` and everything below it to `to`. Inodes already attached
    /// at the destination are detached first.
    pub fn rename(&mut self, from: &HdfsPath, to: &HdfsPath) {
        let displaced: Vec<HdfsPath> = self
            .by_path
            .keys()
            .filter(|p| p.is_within(to))
            .cloned()
            .collect();
        for path in displaced {
            self.by_path.remove(&path);
        }

        let moved: Vec<(HdfsPath, InodeId)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.is_within(from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            self.by_path.remove(&old);
            if let Some(new) = old.rebase(from, to) {
                if let Some(entry) = self.entries.get_mut(&ino) {
                    entry.path = new.clone();
                }
                self.by_path.insert(new, ino);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
