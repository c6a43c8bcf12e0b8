//! `fuser::Filesystem` adapter.
//!
//! Resolves inode numbers to paths, hands the call to the [`Dispatcher`] and
//! turns the result into a kernel reply. Every error leaves as one errno.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, info};

use crate::attr::{check_access, kind_to_fuser_type, to_fuser_attr, AttrPresentation, Attributes};
use crate::config::FeatureConfig;
use crate::dispatcher::{Dispatcher, FsStats};
use crate::error::{FsError, Result};
use crate::idmap::IdMapper;
use crate::inode::{InodeId, InodeTable, ROOT_INODE};
use crate::path::HdfsPath;

const BLOCK_SIZE: u32 = 4096;
const MAX_NAME_LEN: u32 = 255;

/// The mounted filesystem. Owns the inode table; everything remote goes
/// through the shared dispatcher.
pub struct WebHdfsFilesystem {
    dispatcher: Arc<Dispatcher>,
    inodes: InodeTable,
    ids: IdMapper,
    features: FeatureConfig,
    presentation: AttrPresentation,
    ttl: Duration,
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Block counts for statfs: (total, free, available).
fn statfs_blocks(stats: &FsStats) -> (u64, u64, u64) {
    let bs = BLOCK_SIZE as u64;
    let free = stats.available() / bs;
    (stats.capacity / bs, free, free)
}

impl WebHdfsFilesystem {
    pub fn new(dispatcher: Arc<Dispatcher>, ids: IdMapper, features: FeatureConfig, ttl: Duration) -> Self {
        let presentation = AttrPresentation {
            ctime: features.ctime,
            symlinks: features.symlinks,
            block_size: BLOCK_SIZE,
        };
        WebHdfsFilesystem {
            dispatcher,
            inodes: InodeTable::new(),
            ids,
            features,
            presentation,
            ttl,
        }
    }

    fn path_of(&self, ino: InodeId) -> Result<HdfsPath> {
        self.inodes
            .path(ino)
            .cloned()
            .ok_or_else(|| FsError::not_found(format!("inode {}", ino)))
    }

    fn child_path(&self, parent: InodeId, name: &OsStr) -> Result<HdfsPath> {
        let name = name.to_string_lossy();
        if name.is_empty() || name.contains('/') {
            return Err(FsError::not_found(name));
        }
        Ok(self.path_of(parent)?.join(&name))
    }

    fn fuser_attr(&self, ino: InodeId, attr: &Attributes) -> FileAttr {
        let uid = self.ids.uid(&attr.owner);
        let gid = self.ids.gid(&attr.group);
        to_fuser_attr(ino, attr, uid, gid, &self.presentation)
    }

    /// Attributes for `path` with a new kernel reference on its inode.
    fn entry(&mut self, path: &HdfsPath) -> Result<FileAttr> {
        let attr = self.dispatcher.getattr(path)?;
        let ino = self.inodes.lookup(path);
        Ok(self.fuser_attr(ino, &attr))
    }

    fn do_lookup(&mut self, parent: InodeId, name: &OsStr) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        self.entry(&path)
    }

    fn do_getattr(&self, ino: InodeId) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        let attr = self.dispatcher.getattr(&path)?;
        Ok(self.fuser_attr(ino, &attr))
    }

    #[allow(clippy::too_many_arguments)]
    fn do_setattr(
        &self,
        ino: InodeId,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        if let Some(mode) = mode {
            self.dispatcher.chmod(&path, (mode & 0o7777) as u16)?;
        }
        if uid.is_some() || gid.is_some() {
            let owner = uid.map(|u| self.ids.user_name(u));
            let group = gid.map(|g| self.ids.group_name(g));
            self.dispatcher
                .chown(&path, owner.as_deref(), group.as_deref())?;
        }
        if let Some(size) = size {
            self.dispatcher.truncate(&path, size, fh)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.dispatcher
                .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
        }
        self.do_getattr(ino)
    }

    fn do_mkdir(&mut self, parent: InodeId, name: &OsStr, mode: u32, umask: u32) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        let attr = self.dispatcher.mkdir(&path, (mode & !umask & 0o7777) as u16)?;
        let ino = self.inodes.lookup(&path);
        Ok(self.fuser_attr(ino, &attr))
    }

    fn do_unlink(&mut self, parent: InodeId, name: &OsStr) -> Result<()> {
        let path = self.child_path(parent, name)?;
        self.dispatcher.unlink(&path)?;
        self.inodes.unlink(&path);
        Ok(())
    }

    fn do_rmdir(&mut self, parent: InodeId, name: &OsStr) -> Result<()> {
        let path = self.child_path(parent, name)?;
        self.dispatcher.rmdir(&path)?;
        self.inodes.unlink(&path);
        Ok(())
    }

    fn do_rename(
        &mut self,
        parent: InodeId,
        name: &OsStr,
        newparent: InodeId,
        newname: &OsStr,
        flags: u32,
    ) -> std::result::Result<(), c_int> {
        let src = self.child_path(parent, name).map_err(|e| e.to_errno())?;
        let dst = self.child_path(newparent, newname).map_err(|e| e.to_errno())?;
        if flags & libc::RENAME_EXCHANGE != 0 {
            return Err(libc::EINVAL);
        }
        if flags & libc::RENAME_NOREPLACE != 0 && self.dispatcher.getattr(&dst).is_ok() {
            return Err(libc::EEXIST);
        }
        self.dispatcher.rename(&src, &dst).map_err(|e| e.to_errno())?;
        self.inodes.rename(&src, &dst);
        Ok(())
    }

    fn do_create(
        &mut self,
        parent: InodeId,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(FileAttr, u64)> {
        let path = self.child_path(parent, name)?;
        let fh = self
            .dispatcher
            .create(&path, (mode & !umask & 0o7777) as u16, flags)?;
        match self.entry(&path) {
            Ok(attr) => Ok((attr, fh)),
            Err(e) => {
                let _ = self.dispatcher.release(fh);
                Err(e)
            }
        }
    }

    /// All directory entries, `.` and `..` first.
    fn do_readdir(&mut self, ino: InodeId) -> Result<Vec<(InodeId, fuser::FileType, String)>> {
        let path = self.path_of(ino)?;
        let listing = self.dispatcher.readdir(&path)?;
        let parent_ino = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            self.inodes.peek_or_assign(&path.parent())
        };
        let mut entries = Vec::with_capacity(listing.len() + 2);
        entries.push((ino, fuser::FileType::Directory, ".".to_string()));
        entries.push((parent_ino, fuser::FileType::Directory, "..".to_string()));
        for entry in listing {
            let child = self.inodes.peek_or_assign(&path.join(&entry.name));
            let kind = kind_to_fuser_type(entry.attr.kind, self.features.symlinks);
            entries.push((child, kind, entry.name));
        }
        Ok(entries)
    }

    fn do_access(&self, req: &Request<'_>, ino: InodeId, mask: i32) -> Result<bool> {
        let path = self.path_of(ino)?;
        let attr = self.dispatcher.getattr(&path)?;
        let owner_uid = self.ids.uid(&attr.owner);
        let owner_gid = self.ids.gid(&attr.group);
        Ok(check_access(attr.perm, owner_uid, owner_gid, req.uid(), req.gid(), mask))
    }

    /// Errno for xattr queries: "no such attribute" when enabled.
    fn xattr_errno(&self) -> c_int {
        if self.features.xattr {
            libc::ENODATA
        } else {
            libc::EOPNOTSUPP
        }
    }
}

impl Filesystem for WebHdfsFilesystem {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        info!(
            "webhdfs filesystem init (symlinks={}, ctime={}, xattr={})",
            self.features.symlinks, self.features.ctime, self.features.xattr
        );
        Ok(())
    }

    fn destroy(&mut self) {
        match self.dispatcher.open_handles() {
            Ok(0) | Err(_) => info!("webhdfs filesystem unmounted"),
            Ok(n) => tracing::warn!("unmounting with {} open handles", n),
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup parent={} name={}", parent, name.to_string_lossy());
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!("forget ino={} nlookup={}", ino, nlookup);
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr ino={}", ino);
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr ino={} mode={:?} uid={:?} gid={:?} size={:?}",
            ino, mode, uid, gid, size
        );
        match self.do_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink ino={}", ino);
        if !self.features.symlinks {
            reply.error(libc::EOPNOTSUPP);
            return;
        }
        match self.path_of(ino).and_then(|p| self.dispatcher.readlink(&p)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir parent={} name={} mode={:o}", parent, name.to_string_lossy(), mode);
        match self.do_mkdir(parent, name, mode, umask) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink parent={} name={}", parent, name.to_string_lossy());
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir parent={} name={}", parent, name.to_string_lossy());
        match self.do_rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!(
            "symlink parent={} name={} target={}",
            parent,
            link_name.to_string_lossy(),
            target.display()
        );
        reply.error(libc::EOPNOTSUPP);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename parent={} name={} newparent={} newname={}",
            parent,
            name.to_string_lossy(),
            newparent,
            newname.to_string_lossy()
        );
        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link ino={} newparent={} newname={}", ino, newparent, newname.to_string_lossy());
        reply.error(libc::EOPNOTSUPP);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open ino={} flags={:#x}", ino, flags);
        match self.path_of(ino).and_then(|p| self.dispatcher.open(&p, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino={} fh={} offset={} size={}", ino, fh, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.dispatcher.read(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write ino={} fh={} offset={} size={}", ino, fh, offset, data.len());
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.dispatcher.write(fh, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush ino={} fh={}", ino, fh);
        match self.dispatcher.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release ino={} fh={}", ino, fh);
        match self.dispatcher.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync ino={} fh={} datasync={}", ino, fh, datasync);
        match self.dispatcher.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir ino={}", ino);
        match self.path_of(ino).and_then(|p| self.dispatcher.getattr(&p)) {
            Ok(attr) if attr.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir ino={} offset={}", ino, offset);
        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        for (i, (child, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(child, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir ino={}", ino);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        debug!("statfs");
        match self.dispatcher.statfs() {
            Ok(stats) => {
                let (blocks, bfree, bavail) = statfs_blocks(&stats);
                reply.statfs(
                    blocks,
                    bfree,
                    bavail,
                    stats.files,
                    u32::MAX as u64,
                    BLOCK_SIZE,
                    MAX_NAME_LEN,
                    BLOCK_SIZE,
                );
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr ino={} name={}", ino, name.to_string_lossy());
        reply.error(libc::EOPNOTSUPP);
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, _size: u32, reply: ReplyXattr) {
        debug!("getxattr ino={} name={}", ino, name.to_string_lossy());
        reply.error(self.xattr_errno());
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr ino={} size={}", ino, size);
        if !self.features.xattr {
            reply.error(libc::EOPNOTSUPP);
        } else if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr ino={} name={}", ino, name.to_string_lossy());
        reply.error(self.xattr_errno());
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access ino={} mask={}", ino, mask);
        match self.do_access(req, ino, mask) {
            Ok(true) => reply.ok(),
            Ok(false) => reply.error(libc::EACCES),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!(
            "create parent={} name={} mode={:o} flags={:#x}",
            parent,
            name.to_string_lossy(),
            mode,
            flags
        );
        match self.do_create(parent, name, mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&self.ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
