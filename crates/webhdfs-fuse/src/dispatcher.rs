//! Path-based POSIX operations over a [`WebHdfs`] backend.
//!
//! The dispatcher owns the metadata cache and the handle table. Both are
//! locked only for map access; remote calls run with at most the affected
//! handle's own lock held.

use crate::attr::{normalize_listing, system_time_to_millis, Attributes, DirEntry, DirectoryListing, FileKind};
use crate::cache::{Cached, MetadataCache};
use crate::error::{FsError, Result};
use crate::handle::{FileHandle, HandleId, HandleTable, OpenMode, SharedHandle};
use crate::path::HdfsPath;
use crate::status::FileStatusType;
use crate::transport::WebHdfs;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Capacity reported by statfs when the root carries no space quota.
const NOMINAL_CAPACITY: u64 = 1 << 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Buffered bytes that force a flush from inside `write`.
    pub flush_threshold: usize,
    /// Minimum bytes fetched by a read that misses the handle's window.
    pub read_ahead: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            flush_threshold: 4 << 20,
            read_ahead: 1 << 20,
        }
    }
}

/// Space usage of the whole namespace, in bytes and entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub capacity: u64,
    pub used: u64,
    pub files: u64,
}

impl FsStats {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

pub struct Dispatcher {
    hdfs: Arc<dyn WebHdfs>,
    cache: Mutex<MetadataCache>,
    handles: Mutex<HandleTable>,
    io: IoConfig,
    /// Owner reported for files that exist only as local handles.
    user: String,
}

fn with_op(err: FsError, op: &str) -> FsError {
    match err {
        FsError::PermissionDenied { path, .. } => FsError::PermissionDenied {
            path,
            op: op.to_string(),
        },
        other => other,
    }
}

fn lock_handle(shared: &SharedHandle) -> Result<MutexGuard<'_, FileHandle>> {
    shared
        .lock()
        .map_err(|_| FsError::internal("file handle lock poisoned"))
}

impl Dispatcher {
    pub fn new(hdfs: Arc<dyn WebHdfs>, cache: MetadataCache, io: IoConfig, user: impl Into<String>) -> Self {
        let user = user.into();
        debug!(
            "dispatcher ready: flush_threshold={}, read_ahead={}, user={}",
            io.flush_threshold, io.read_ahead, user
        );
        Dispatcher {
            hdfs,
            cache: Mutex::new(cache),
            handles: Mutex::new(HandleTable::new()),
            io,
            user,
        }
    }

    fn cache(&self) -> Result<MutexGuard<'_, MetadataCache>> {
        self.cache
            .lock()
            .map_err(|_| FsError::internal("metadata cache lock poisoned"))
    }

    fn handles(&self) -> Result<MutexGuard<'_, HandleTable>> {
        self.handles
            .lock()
            .map_err(|_| FsError::internal("handle table lock poisoned"))
    }

    fn shared_handle(&self, fh: HandleId) -> Result<SharedHandle> {
        self.handles()?.get(fh).ok_or(FsError::BadHandle { fh })
    }

    fn publish(&self, fh: HandleId, handle: &FileHandle) -> Result<()> {
        self.handles()?.publish(fh, handle.summary());
        Ok(())
    }

    fn invalidate(&self, path: &HdfsPath) -> Result<()> {
        self.cache()?.invalidate(path);
        Ok(())
    }

    /// Remote attributes, cached. `None` when the path does not exist remotely.
    fn stat(&self, path: &HdfsPath) -> Result<Option<Attributes>> {
        let generation = {
            let mut cache = self.cache()?;
            match cache.get_attr(path) {
                Cached::Hit(attr) => return Ok(Some(attr)),
                Cached::Absent => return Ok(None),
                Cached::Miss => cache.generation(),
            }
        };
        match self.hdfs.get_file_status(path) {
            Ok(status) => {
                let attr = Attributes::from_status(&status);
                self.cache()?
                    .insert_attr_since(generation, path.clone(), attr.clone());
                Ok(Some(attr))
            }
            Err(FsError::NotFound { .. }) => {
                self.cache()?.insert_negative_since(generation, path.clone());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Folds in what open write handles know that the remote store doesn't yet.
    fn overlay(&self, path: &HdfsPath, remote: Option<Attributes>) -> Result<Option<Attributes>> {
        let summaries = self.handles()?.summaries_for(path);
        let mut attr = remote;
        for s in summaries.iter().filter(|s| s.writable) {
            match attr.as_mut() {
                Some(a) if s.needs_create => a.size = s.end_offset,
                Some(a) => a.size = a.size.max(s.end_offset),
                None if s.needs_create => {
                    attr = Some(Attributes::pending_file(s.end_offset, s.permission, &self.user))
                }
                None => {}
            }
        }
        Ok(attr)
    }

    fn require_dir(&self, path: &HdfsPath) -> Result<Attributes> {
        let attr = self.getattr(path)?;
        if !attr.is_dir() {
            return Err(FsError::NotADirectory {
                path: path.to_string(),
            });
        }
        Ok(attr)
    }

    fn is_pending_only(&self, path: &HdfsPath) -> Result<bool> {
        Ok(self
            .handles()?
            .summaries_for(path)
            .iter()
            .any(|s| s.is_pending_only()))
    }

    pub fn getattr(&self, path: &HdfsPath) -> Result<Attributes> {
        debug!("getattr: path={}", path);
        let remote = self.stat(path)?;
        self.overlay(path, remote)?
            .ok_or_else(|| FsError::not_found(path))
    }

    /// Remote listing of `dir`, cached.
    fn list(&self, dir: &HdfsPath) -> Result<DirectoryListing> {
        let generation = {
            let mut cache = self.cache()?;
            if let Some(listing) = cache.get_listing(dir) {
                return Ok(listing);
            }
            cache.generation()
        };
        let statuses = self.hdfs.list_status(dir)?;
        // LISTSTATUS on a file answers with the file itself and an empty suffix.
        if let [only] = statuses.as_slice() {
            if only.path_suffix.is_empty() && only.kind != FileStatusType::Directory {
                return Err(FsError::NotADirectory {
                    path: dir.to_string(),
                });
            }
        }
        let listing: DirectoryListing = statuses
            .iter()
            .map(|s| DirEntry {
                name: s.path_suffix.clone(),
                attr: Attributes::from_status(s),
            })
            .collect();
        let listing = normalize_listing(dir, listing);
        self.cache()?
            .insert_listing_since(generation, dir.clone(), listing.clone());
        Ok(listing)
    }

    pub fn readdir(&self, path: &HdfsPath) -> Result<DirectoryListing> {
        debug!("readdir: path={}", path);
        let mut listing = self.list(path)?;
        let pending = self.handles()?.pending_children(path);
        for s in pending {
            let name = s.path.file_name();
            if !listing.iter().any(|e| e.name == name) {
                listing.push(DirEntry {
                    name: name.to_string(),
                    attr: Attributes::pending_file(s.end_offset, s.permission, &self.user),
                });
            }
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Allocates a write handle. Nothing is sent until the first flush.
    pub fn create(&self, path: &HdfsPath, mode: u16, flags: i32) -> Result<HandleId> {
        debug!("create: path={}, mode={:o}, flags={:#x}", path, mode, flags);
        if path.is_root() {
            return Err(FsError::AlreadyExists {
                path: path.to_string(),
            });
        }
        self.require_dir(&path.parent())?;
        let existing = self.stat(path)?;
        match &existing {
            Some(attr) if attr.is_dir() => {
                return Err(FsError::IsADirectory {
                    path: path.to_string(),
                })
            }
            Some(_) if flags & libc::O_EXCL != 0 => {
                return Err(FsError::AlreadyExists {
                    path: path.to_string(),
                })
            }
            _ => {}
        }
        let readable = flags & libc::O_ACCMODE == libc::O_RDWR;
        let handle = match existing {
            // Someone else created it first: open it for append, keep its bytes.
            Some(attr) if flags & libc::O_TRUNC == 0 => {
                debug!("create: {} already exists, opening for append", path);
                FileHandle::new(path.clone(), OpenMode::Append, readable, attr.perm, attr.size, true)
            }
            existing => FileHandle::new(
                path.clone(),
                OpenMode::Create,
                readable,
                mode & 0o7777,
                0,
                existing.is_some(),
            ),
        };
        Ok(self.handles()?.insert(handle))
    }

    pub fn open(&self, path: &HdfsPath, flags: i32) -> Result<HandleId> {
        debug!("open: path={}, flags={:#x}", path, flags);
        let (mode, readable) = OpenMode::from_flags(flags);
        let attr = self.getattr(path)?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let remote_exists = !self.is_pending_only(path)?;
        let mode = if mode == OpenMode::Append && !remote_exists {
            OpenMode::Create
        } else {
            mode
        };
        let remote_len = if remote_exists { attr.size } else { 0 };
        let handle = FileHandle::new(path.clone(), mode, readable, attr.perm, remote_len, remote_exists);
        Ok(self.handles()?.insert(handle))
    }

    pub fn read(&self, fh: HandleId, offset: u64, size: usize) -> Result<Bytes> {
        debug!("read: fh={}, offset={}, size={}", fh, offset, size);
        let shared = self.shared_handle(fh)?;
        let mut handle = lock_handle(&shared)?;
        if handle.buffered_len() > 0 {
            self.flush_locked(fh, &mut handle)?;
        }
        handle.read(self.hdfs.as_ref(), fh, offset, size, self.io.read_ahead)
    }

    pub fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        debug!("write: fh={}, offset={}, size={}", fh, offset, data.len());
        let shared = self.shared_handle(fh)?;
        let mut handle = lock_handle(&shared)?;
        let result = handle.write(self.hdfs.as_ref(), fh, offset, data, self.io.flush_threshold);
        self.publish(fh, &handle)?;
        if result? {
            self.invalidate(handle.path())?;
        }
        Ok(data.len())
    }

    fn flush_locked(&self, fh: HandleId, handle: &mut FileHandle) -> Result<bool> {
        let result = handle.flush(self.hdfs.as_ref());
        self.publish(fh, handle)?;
        let flushed = result?;
        if flushed {
            self.invalidate(handle.path())?;
        }
        Ok(flushed)
    }

    pub fn flush(&self, fh: HandleId) -> Result<()> {
        debug!("flush: fh={}", fh);
        let shared = self.shared_handle(fh)?;
        let mut handle = lock_handle(&shared)?;
        self.flush_locked(fh, &mut handle).map(|_| ())
    }

    pub fn fsync(&self, fh: HandleId) -> Result<()> {
        self.flush(fh)
    }

    /// Final flush, then frees the handle. Flush failures are logged only.
    pub fn release(&self, fh: HandleId) -> Result<()> {
        debug!("release: fh={}", fh);
        let shared = self.shared_handle(fh)?;
        match lock_handle(&shared) {
            Ok(mut handle) => {
                if let Err(e) = self.flush_locked(fh, &mut handle) {
                    warn!(
                        "dropping {} unflushed bytes for {} on release: {}",
                        handle.buffered_len(),
                        handle.path(),
                        e
                    );
                }
            }
            Err(e) => warn!("release of handle {}: {}", fh, e),
        }
        self.handles()?.remove(fh);
        Ok(())
    }

    pub fn truncate(&self, path: &HdfsPath, size: u64, fh: Option<HandleId>) -> Result<()> {
        debug!("truncate: path={}, size={}, fh={:?}", path, size, fh);
        if let Some(fh) = fh {
            let shared = self.shared_handle(fh)?;
            let mut handle = lock_handle(&shared)?;
            if handle.needs_create() && handle.path() == path {
                if size == handle.end_offset() {
                    return Ok(());
                }
                if size != 0 {
                    return Err(FsError::unsupported(format!("truncate to {}", size)));
                }
                handle.reset_truncated();
                return self.publish(fh, &handle);
            }
        }

        let attr = self.getattr(path)?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        if size == attr.size {
            return Ok(());
        }
        if size != 0 {
            return Err(FsError::unsupported(format!(
                "truncate {} from {} to {}",
                path, attr.size, size
            )));
        }
        if !self.is_pending_only(path)? {
            self.hdfs.create(path, attr.perm, true, Bytes::new())?;
            self.invalidate(path)?;
        }

        let targets = match fh {
            Some(fh) => vec![(fh, self.shared_handle(fh)?)],
            None => self.handles()?.handles_for(path),
        };
        for (id, shared) in targets {
            let mut handle = lock_handle(&shared)?;
            if handle.is_writable() {
                handle.reset_truncated();
                self.publish(id, &handle)?;
            }
        }
        Ok(())
    }

    pub fn unlink(&self, path: &HdfsPath) -> Result<()> {
        debug!("unlink: path={}", path);
        let attr = self.getattr(path)?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.to_string(),
            });
        }
        let deleted = self.hdfs.delete(path, false);
        self.invalidate(path)?;
        if !deleted? {
            return Err(FsError::not_found(path));
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &HdfsPath) -> Result<()> {
        debug!("rmdir: path={}", path);
        if path.is_root() {
            return Err(FsError::PermissionDenied {
                path: path.to_string(),
                op: "rmdir".to_string(),
            });
        }
        self.require_dir(path)?;
        if !self.handles()?.pending_children(path).is_empty() {
            return Err(FsError::NotEmpty {
                path: path.to_string(),
            });
        }

        match self.hdfs.delete(path, false) {
            Ok(true) => {
                self.cache()?.invalidate_subtree(path);
                Ok(())
            }
            Ok(false) => {
                self.invalidate(path)?;
                Err(FsError::not_found(path))
            }
            Err(FsError::NotEmpty { .. }) => Err(FsError::NotEmpty {
                path: path.to_string(),
            }),
            Err(e) => {
                // Some servers reject a non-recursive delete of a populated
                // directory without saying why.
                self.invalidate(path)?;
                match self.list(path) {
                    Ok(children) if !children.is_empty() => Err(FsError::NotEmpty {
                        path: path.to_string(),
                    }),
                    _ => Err(e),
                }
            }
        }
    }

    pub fn mkdir(&self, path: &HdfsPath, mode: u16) -> Result<Attributes> {
        debug!("mkdir: path={}, mode={:o}", path, mode);
        if self.overlay(path, self.stat(path)?)?.is_some() {
            return Err(FsError::AlreadyExists {
                path: path.to_string(),
            });
        }
        self.require_dir(&path.parent())?;
        let created = self.hdfs.mkdirs(path, mode & 0o7777);
        self.invalidate(path)?;
        if !created? {
            return Err(FsError::io(format!("MKDIRS {} returned false", path)));
        }
        self.getattr(path)
    }

    pub fn rename(&self, src: &HdfsPath, dst: &HdfsPath) -> Result<()> {
        debug!("rename: {} -> {}", src, dst);
        if src.is_root() || dst.is_root() {
            return Err(FsError::PermissionDenied {
                path: src.to_string(),
                op: "rename".to_string(),
            });
        }
        let src_attr = self.getattr(src)?;
        if src == dst {
            return Ok(());
        }
        if dst.is_within(src) {
            return Err(FsError::unsupported(format!(
                "rename {} into its own subtree {}",
                src, dst
            )));
        }
        self.require_dir(&dst.parent())?;

        if let Some(dst_attr) = self.overlay(dst, self.stat(dst)?)? {
            match (src_attr.is_dir(), dst_attr.is_dir()) {
                (false, true) => {
                    return Err(FsError::IsADirectory {
                        path: dst.to_string(),
                    })
                }
                (true, false) => {
                    return Err(FsError::NotADirectory {
                        path: dst.to_string(),
                    })
                }
                (true, true) => {
                    if !self.readdir(dst)?.is_empty() {
                        return Err(FsError::NotEmpty {
                            path: dst.to_string(),
                        });
                    }
                }
                (false, false) => {}
            }
            if !self.is_pending_only(dst)? {
                let removed = self.hdfs.delete(dst, false);
                self.cache()?.invalidate_subtree(dst);
                removed?;
            }
        }

        if !self.is_pending_only(src)? {
            let renamed = self.hdfs.rename(src, dst);
            {
                let mut cache = self.cache()?;
                cache.invalidate_subtree(src);
                cache.invalidate_subtree(dst);
            }
            if !renamed? {
                return match self.hdfs.get_file_status(src) {
                    Err(FsError::NotFound { .. }) => Err(FsError::not_found(src)),
                    Err(e) => Err(e),
                    Ok(_) => Err(FsError::io(format!("RENAME {} -> {} returned false", src, dst))),
                };
            }
        }

        let moved = self.handles()?.rebase(src, dst);
        for (shared, path) in moved {
            lock_handle(&shared)?.set_path(path);
        }
        Ok(())
    }

    pub fn chmod(&self, path: &HdfsPath, mode: u16) -> Result<()> {
        debug!("chmod: path={}, mode={:o}", path, mode);
        let mode = mode & 0o7777;
        let pending_only = self.is_pending_only(path)?;
        if !pending_only {
            let result = self.hdfs.set_permission(path, mode);
            self.invalidate(path)?;
            result.map_err(|e| with_op(e, "chmod"))?;
        }
        let targets = self.handles()?.handles_for(path);
        for (id, shared) in targets {
            let mut handle = lock_handle(&shared)?;
            handle.set_permission(mode);
            self.publish(id, &handle)?;
        }
        Ok(())
    }

    pub fn chown(&self, path: &HdfsPath, owner: Option<&str>, group: Option<&str>) -> Result<()> {
        debug!("chown: path={}, owner={:?}, group={:?}", path, owner, group);
        if owner.is_none() && group.is_none() {
            return self.getattr(path).map(|_| ());
        }
        if self.is_pending_only(path)? {
            return Err(FsError::PermissionDenied {
                path: path.to_string(),
                op: "chown".to_string(),
            });
        }
        let result = self.hdfs.set_owner(path, owner, group);
        self.invalidate(path)?;
        result.map_err(|e| with_op(e, "chown"))
    }

    pub fn utimens(&self, path: &HdfsPath, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Result<()> {
        debug!("utimens: path={}, atime={:?}, mtime={:?}", path, atime, mtime);
        if (atime.is_none() && mtime.is_none()) || self.is_pending_only(path)? {
            return self.getattr(path).map(|_| ());
        }
        let result = self.hdfs.set_times(
            path,
            atime.map(system_time_to_millis),
            mtime.map(system_time_to_millis),
        );
        self.invalidate(path)?;
        result
    }

    pub fn readlink(&self, path: &HdfsPath) -> Result<String> {
        debug!("readlink: path={}", path);
        let attr = self.getattr(path)?;
        match (attr.kind, attr.symlink_target) {
            (FileKind::Symlink, Some(target)) => Ok(target),
            _ => Err(FsError::unsupported(format!("readlink {}", path))),
        }
    }

    pub fn statfs(&self) -> Result<FsStats> {
        debug!("statfs");
        let summary = self.hdfs.content_summary(&HdfsPath::root())?;
        let used = summary.space_consumed;
        let capacity = if summary.space_quota > 0 {
            summary.space_quota as u64
        } else {
            NOMINAL_CAPACITY.max(used)
        };
        Ok(FsStats {
            capacity,
            used,
            files: summary.file_count + summary.directory_count,
        })
    }

    pub fn open_handles(&self) -> Result<usize> {
        Ok(self.handles()?.count())
    }

    pub fn cache_stats(&self) -> Result<crate::cache::CacheStats> {
        Ok(self.cache()?.stats())
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.cache()?.clear();
        Ok(())
    }
}
