//! Open-file state and the table that owns it.

use crate::error::{FsError, Result};
use crate::path::HdfsPath;
use crate::transport::WebHdfs;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// The first flush replaces the remote file (CREATE overwrite=true).
    Create,
    /// Flushes extend the remote file (APPEND).
    Append,
}

impl OpenMode {
    /// Splits libc open flags into a mode and whether reads are allowed.
    pub fn from_flags(flags: i32) -> (OpenMode, bool) {
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => (OpenMode::Read, true),
            acc => {
                let mode = if flags & libc::O_TRUNC != 0 {
                    OpenMode::Create
                } else {
                    OpenMode::Append
                };
                (mode, acc == libc::O_RDWR)
            }
        }
    }
}

#[derive(Debug)]
pub enum HandleState {
    Idle,
    /// Bytes accepted from the caller but not yet sent.
    Buffering(BytesMut),
    /// Last range fetched from the remote file.
    Streaming { window_start: u64, window: Bytes },
}

/// What other operations need to know about a handle without locking it.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleSummary {
    pub path: HdfsPath,
    pub writable: bool,
    /// Next flush is a CREATE.
    pub needs_create: bool,
    /// The remote file existed when the handle was opened, or has been
    /// created by a flush since.
    pub remote_exists: bool,
    pub end_offset: u64,
    pub permission: u16,
}

impl HandleSummary {
    /// Created locally and never flushed: the path has no remote counterpart.
    pub fn is_pending_only(&self) -> bool {
        self.needs_create && !self.remote_exists
    }
}

#[derive(Debug)]
pub struct FileHandle {
    path: HdfsPath,
    mode: OpenMode,
    readable: bool,
    permission: u16,
    /// Length of the remote file as far as this handle knows.
    remote_len: u64,
    needs_create: bool,
    remote_exists: bool,
    state: HandleState,
}

impl FileHandle {
    pub fn new(
        path: HdfsPath,
        mode: OpenMode,
        readable: bool,
        permission: u16,
        remote_len: u64,
        remote_exists: bool,
    ) -> Self {
        let remote_len = if mode == OpenMode::Create { 0 } else { remote_len };
        FileHandle {
            path,
            mode,
            readable: readable || mode == OpenMode::Read,
            permission,
            remote_len,
            needs_create: mode == OpenMode::Create,
            remote_exists,
            state: HandleState::Idle,
        }
    }

    pub fn path(&self) -> &HdfsPath {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn state(&self) -> &HandleState {
        &self.state
    }

    pub fn is_writable(&self) -> bool {
        self.mode != OpenMode::Read
    }

    pub fn needs_create(&self) -> bool {
        self.needs_create
    }

    pub fn buffered_len(&self) -> usize {
        match &self.state {
            HandleState::Buffering(buf) => buf.len(),
            _ => 0,
        }
    }

    /// Offset the next write must start at.
    pub fn end_offset(&self) -> u64 {
        self.remote_len + self.buffered_len() as u64
    }

    pub fn set_permission(&mut self, permission: u16) {
        self.permission = permission;
    }

    pub fn set_path(&mut self, path: HdfsPath) {
        self.path = path;
    }

    pub fn summary(&self) -> HandleSummary {
        HandleSummary {
            path: self.path.clone(),
            writable: self.is_writable(),
            needs_create: self.needs_create,
            remote_exists: self.remote_exists,
            end_offset: self.end_offset(),
            permission: self.permission,
        }
    }

    /// Appends `data` to the buffer. Only the current end offset is accepted.
    pub fn buffer(&mut self, fh: HandleId, offset: u64, data: &[u8]) -> Result<()> {
        if !self.is_writable() {
            return Err(FsError::BadHandle { fh });
        }
        let end = self.end_offset();
        if offset != end {
            tracing::debug!(
                "rejecting write to {} at {} (end of buffer is {})",
                self.path,
                offset,
                end
            );
            return Err(FsError::unsupported(format!(
                "write at offset {} (expected {})",
                offset, end
            )));
        }
        match &mut self.state {
            HandleState::Buffering(buf) => buf.extend_from_slice(data),
            state => *state = HandleState::Buffering(BytesMut::from(data)),
        }
        Ok(())
    }

    /// Buffers `data` and flushes once the buffer reaches `threshold` bytes.
    /// A failed flush leaves only the bytes buffered before this write.
    pub fn write(
        &mut self,
        hdfs: &dyn WebHdfs,
        fh: HandleId,
        offset: u64,
        data: &[u8],
        threshold: usize,
    ) -> Result<bool> {
        let before = self.buffered_len();
        self.buffer(fh, offset, data)?;
        if self.buffered_len() < threshold.max(1) {
            return Ok(false);
        }
        match self.flush(hdfs) {
            Ok(flushed) => Ok(flushed),
            Err(e) => {
                if let HandleState::Buffering(buf) = &mut self.state {
                    buf.truncate(before);
                }
                Err(e)
            }
        }
    }

    /// Sends buffered bytes in one CREATE or APPEND. Returns whether a remote
    /// call was made. On failure the bytes stay buffered.
    pub fn flush(&mut self, hdfs: &dyn WebHdfs) -> Result<bool> {
        let batch = match &mut self.state {
            HandleState::Buffering(buf) => buf.split().freeze(),
            _ => Bytes::new(),
        };
        if batch.is_empty() && !self.needs_create {
            return Ok(false);
        }

        let result = if self.needs_create {
            hdfs.create(&self.path, self.permission, true, batch.clone())
        } else {
            hdfs.append(&self.path, batch.clone())
        };

        match result {
            Ok(()) => {
                tracing::debug!(
                    "flushed {} bytes to {} ({})",
                    batch.len(),
                    self.path,
                    if self.needs_create { "CREATE" } else { "APPEND" }
                );
                self.remote_len += batch.len() as u64;
                self.needs_create = false;
                self.remote_exists = true;
                self.state = HandleState::Idle;
                Ok(true)
            }
            Err(e) => {
                self.state = HandleState::Buffering(BytesMut::from(&batch[..]));
                Err(e)
            }
        }
    }

    /// Drops buffered bytes and treats the file as empty. A handle that still
    /// owes a CREATE keeps owing it.
    pub fn reset_truncated(&mut self) {
        self.remote_len = 0;
        self.state = HandleState::Idle;
    }

    /// Reads up to `size` bytes at `offset`, serving from the current window
    /// when it covers the request and fetching `read_ahead` bytes otherwise.
    pub fn read(
        &mut self,
        hdfs: &dyn WebHdfs,
        fh: HandleId,
        offset: u64,
        size: usize,
        read_ahead: u64,
    ) -> Result<Bytes> {
        if !self.readable {
            return Err(FsError::BadHandle { fh });
        }
        // Until the CREATE lands the file is whatever this handle holds, and
        // the caller flushes those bytes before reading.
        if size == 0 || (self.needs_create && offset >= self.end_offset()) {
            return Ok(Bytes::new());
        }

        if offset >= self.remote_len {
            // The file may have grown since open.
            let status = hdfs.get_file_status(&self.path)?;
            self.remote_len = status.length;
            if offset >= self.remote_len {
                return Ok(Bytes::new());
            }
        }

        if let HandleState::Streaming {
            window_start,
            window,
        } = &self.state
        {
            let window_end = window_start + window.len() as u64;
            let covered = offset >= *window_start
                && offset < window_end
                && (offset + size as u64 <= window_end || window_end >= self.remote_len);
            if covered {
                let start = (offset - window_start) as usize;
                let end = (start + size).min(window.len());
                return Ok(window.slice(start..end));
            }
        }

        let want = (size as u64).max(read_ahead).min(self.remote_len - offset);
        let window = hdfs.open(&self.path, offset, want)?;
        tracing::trace!(
            "fetched window {}..{} of {}",
            offset,
            offset + window.len() as u64,
            self.path
        );
        let out = window.slice(0..size.min(window.len()));
        if window.len() as u64 != want {
            self.remote_len = offset + window.len() as u64;
        }
        self.state = HandleState::Streaming {
            window_start: offset,
            window,
        };
        Ok(out)
    }
}

pub type SharedHandle = Arc<Mutex<FileHandle>>;

struct Slot {
    handle: SharedHandle,
    summary: HandleSummary,
}

/// Identifier-to-handle map. Handles are locked individually; this table is
/// only ever locked for map access.
pub struct HandleTable {
    next_id: HandleId,
    slots: HashMap<HandleId, Slot>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next_id: 1,
            slots: HashMap::new(),
        }
    }

    pub fn insert(&mut self, handle: FileHandle) -> HandleId {
        let id = self.next_id;
        self.next_id += 1;
        let summary = handle.summary();
        tracing::debug!(
            "opened handle {} for {} (writable={})",
            id,
            summary.path,
            summary.writable
        );
        self.slots.insert(
            id,
            Slot {
                handle: Arc::new(Mutex::new(handle)),
                summary,
            },
        );
        id
    }

    pub fn get(&self, id: HandleId) -> Option<SharedHandle> {
        self.slots.get(&id).map(|s| Arc::clone(&s.handle))
    }

    pub fn summary(&self, id: HandleId) -> Option<&HandleSummary> {
        self.slots.get(&id).map(|s| &s.summary)
    }

    /// Records the latest state of a handle for lock-free observers.
    pub fn publish(&mut self, id: HandleId, summary: HandleSummary) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.summary = summary;
        }
    }

    pub fn remove(&mut self, id: HandleId) -> Option<SharedHandle> {
        let slot = self.slots.remove(&id)?;
        tracing::debug!("released handle {} for {}", id, slot.summary.path);
        Some(slot.handle)
    }

    pub fn summaries_for(&self, path: &HdfsPath) -> Vec<HandleSummary> {
        self.slots
            .values()
            .filter(|s| &s.summary.path == path)
            .map(|s| s.summary.clone())
            .collect()
    }

    /// Summaries of created-but-unflushed files directly inside `dir`.
    pub fn pending_children(&self, dir: &HdfsPath) -> Vec<HandleSummary> {
        self.slots
            .values()
            .filter(|s| s.summary.is_pending_only())
            .filter(|s| !s.summary.path.is_root() && &s.summary.path.parent() == dir)
            .map(|s| s.summary.clone())
            .collect()
    }

    pub fn handles_for(&self, path: &HdfsPath) -> Vec<(HandleId, SharedHandle)> {
        self.slots
            .iter()
            .filter(|(_, s)| &s.summary.path == path)
            .map(|(id, s)| (*id, Arc::clone(&s.handle)))
            .collect()
    }

    /// Handles whose path is `root` or below it, after updating their
    /// summaries to live under `new_root`. The caller retargets the handles.
    pub fn rebase(&mut self, root: &HdfsPath, new_root: &HdfsPath) -> Vec<(SharedHandle, HdfsPath)> {
        let mut moved = Vec::new();
        for slot in self.slots.values_mut() {
            if let Some(path) = slot.summary.path.rebase(root, new_root) {
                slot.summary.path = path.clone();
                moved.push((Arc::clone(&slot.handle), path));
            }
        }
        moved
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
