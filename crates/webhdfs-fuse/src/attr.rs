use crate::path::HdfsPath;
use crate::status::{FileStatus, FileStatusType};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
}

/// Snapshot of a remote entry's metadata. There is no change-time field;
/// callers see a fixed sentinel unless the ctime feature is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub kind: FileKind,
    pub size: u64,
    pub perm: u16,
    pub owner: String,
    pub group: String,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub block_size: u64,
    pub replication: u16,
    pub symlink_target: Option<String>,
}

impl Attributes {
    pub fn from_status(status: &FileStatus) -> Self {
        let kind = match status.kind {
            FileStatusType::File => FileKind::RegularFile,
            FileStatusType::Directory => FileKind::Directory,
            FileStatusType::Symlink => FileKind::Symlink,
        };
        Attributes {
            kind,
            size: if kind == FileKind::Directory {
                0
            } else {
                status.length
            },
            perm: status.permission_bits(),
            owner: status.owner.clone(),
            group: status.group.clone(),
            mtime: millis_to_system_time(status.modification_time),
            atime: millis_to_system_time(status.access_time),
            block_size: status.block_size,
            replication: status.replication,
            symlink_target: status.symlink.clone(),
        }
    }

    /// Attributes for a file that so far exists only as an open local handle.
    pub fn pending_file(size: u64, perm: u16, owner: &str) -> Self {
        let now = SystemTime::now();
        Attributes {
            kind: FileKind::RegularFile,
            size,
            perm,
            owner: owner.to_string(),
            group: String::new(),
            mtime: now,
            atime: now,
            block_size: 0,
            replication: 0,
            symlink_target: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

pub fn millis_to_system_time(ms: i64) -> SystemTime {
    if ms <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    }
}

pub fn system_time_to_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One child of a directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub attr: Attributes,
}

/// Immediate children of a directory, ordered by name.
pub type DirectoryListing = Vec<DirEntry>;

/// Per-mount knobs that change how attributes are presented to the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrPresentation {
    pub ctime: bool,
    pub symlinks: bool,
    pub block_size: u32,
}

pub fn kind_to_fuser_type(kind: FileKind, symlinks: bool) -> fuser::FileType {
    match kind {
        FileKind::RegularFile => fuser::FileType::RegularFile,
        FileKind::Directory => fuser::FileType::Directory,
        FileKind::Symlink if symlinks => fuser::FileType::Symlink,
        FileKind::Symlink => fuser::FileType::RegularFile,
    }
}

pub fn to_fuser_attr(
    ino: u64,
    attr: &Attributes,
    uid: u32,
    gid: u32,
    presentation: &AttrPresentation,
) -> fuser::FileAttr {
    let kind = kind_to_fuser_type(attr.kind, presentation.symlinks);
    let size = match (attr.kind, &attr.symlink_target) {
        (FileKind::Symlink, Some(target)) if presentation.symlinks => target.len() as u64,
        _ => attr.size,
    };
    let ctime = if presentation.ctime {
        attr.mtime
    } else {
        UNIX_EPOCH
    };
    fuser::FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime,
        crtime: UNIX_EPOCH,
        kind,
        perm: attr.perm,
        nlink: if attr.is_dir() { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: presentation.block_size,
        flags: 0,
    }
}

/// Permission-bit check for `access(2)`. `mask` is a combination of
/// `R_OK`, `W_OK` and `X_OK`; `F_OK` (0) always passes. Root bypasses read
/// and write checks but needs at least one execute bit for `X_OK`.
pub fn check_access(perm: u16, owner_uid: u32, owner_gid: u32, uid: u32, gid: u32, mask: i32) -> bool {
    let wanted = (mask & (libc::R_OK | libc::W_OK | libc::X_OK)) as u16;
    if wanted == 0 {
        return true;
    }
    if uid == 0 {
        return wanted & libc::X_OK as u16 == 0 || perm & 0o111 != 0;
    }
    let class = if uid == owner_uid {
        (perm >> 6) & 0o7
    } else if gid == owner_gid {
        (perm >> 3) & 0o7
    } else {
        perm & 0o7
    };
    class & wanted == wanted
}

/// Sorts entries by name and drops `.`/`..` or empty names a server might emit.
pub fn normalize_listing(dir: &HdfsPath, mut listing: DirectoryListing) -> DirectoryListing {
    listing.retain(|e| !e.name.is_empty() && e.name != "." && e.name != ".." && !e.name.contains('/'));
    listing.sort_by(|a, b| a.name.cmp(&b.name));
    listing.dedup_by(|a, b| a.name == b.name);
    tracing::trace!("normalized listing of {} ({} entries)", dir, listing.len());
    listing
}
