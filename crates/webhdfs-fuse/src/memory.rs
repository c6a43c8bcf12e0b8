//! In-process [`WebHdfs`] backend.
//!
//! Mirrors the NameNode semantics the filesystem relies on (CREATE creates
//! missing parents, DELETE of a missing path answers `false`, RENAME onto an
//! existing directory moves into it) and counts every call so tests can assert
//! how many round trips an operation cost. Failures can be injected per op.

use crate::attr::system_time_to_millis;
use crate::error::{FsError, Result};
use crate::path::HdfsPath;
use crate::status::{ContentSummary, FileStatus, FileStatusType};
use crate::transport::WebHdfs;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, Clone)]
struct Node {
    data: Option<Vec<u8>>,
    perm: u16,
    owner: String,
    group: String,
    mtime: i64,
    atime: i64,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.data.is_none()
    }
}

struct MemState {
    nodes: BTreeMap<HdfsPath, Node>,
    calls: HashMap<&'static str, u64>,
    failures: HashMap<&'static str, u32>,
    reject_ownership: bool,
}

pub struct MemoryHdfs {
    state: Mutex<MemState>,
    user: String,
}

fn now_ms() -> i64 {
    system_time_to_millis(SystemTime::now())
}

impl MemoryHdfs {
    pub fn new() -> Self {
        Self::with_user("hdfs")
    }

    pub fn with_user(user: &str) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            HdfsPath::root(),
            Node {
                data: None,
                perm: 0o755,
                owner: user.to_string(),
                group: "supergroup".to_string(),
                mtime: now_ms(),
                atime: 0,
            },
        );
        Self {
            state: Mutex::new(MemState {
                nodes,
                calls: HashMap::new(),
                failures: HashMap::new(),
                reject_ownership: false,
            }),
            user: user.to_string(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Counts the call and consumes one injected failure for `op`, if any.
    fn enter(&self, state: &mut MemState, op: &'static str, path: &HdfsPath) -> Result<()> {
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(remaining) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FsError::io(format!("{} {}: injected failure", op, path)));
            }
        }
        Ok(())
    }

    fn new_node(&self, data: Option<Vec<u8>>, perm: u16) -> Node {
        let now = now_ms();
        Node {
            data,
            perm,
            owner: self.user.clone(),
            group: "supergroup".to_string(),
            mtime: now,
            atime: now,
        }
    }

    fn make_parents(&self, state: &mut MemState, path: &HdfsPath) -> Result<()> {
        let mut cur = HdfsPath::root();
        for comp in path.parent().components() {
            cur = cur.join(comp);
            match state.nodes.get(&cur) {
                Some(n) if n.is_dir() => {}
                Some(_) => {
                    return Err(FsError::NotADirectory {
                        path: cur.to_string(),
                    })
                }
                None => {
                    let node = self.new_node(None, 0o755);
                    state.nodes.insert(cur.clone(), node);
                }
            }
        }
        Ok(())
    }

    fn status_of(path: &HdfsPath, node: &Node, suffix: &str) -> FileStatus {
        tracing::trace!("status of {}", path);
        FileStatus {
            access_time: node.atime,
            block_size: if node.is_dir() { 0 } else { 134_217_728 },
            group: node.group.clone(),
            length: node.data.as_ref().map_or(0, |d| d.len() as u64),
            modification_time: node.mtime,
            owner: node.owner.clone(),
            path_suffix: suffix.to_string(),
            permission: format!("{:o}", node.perm),
            replication: if node.is_dir() { 0 } else { 3 },
            kind: if node.is_dir() {
                FileStatusType::Directory
            } else {
                FileStatusType::File
            },
            symlink: None,
            children_num: None,
        }
    }

    fn children<'a>(state: &'a MemState, dir: &'a HdfsPath) -> impl Iterator<Item = (&'a HdfsPath, &'a Node)> {
        state
            .nodes
            .iter()
            .filter(move |(p, _)| !p.is_root() && p.parent() == *dir)
    }

    /// Seeds a file, creating parents as needed.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let path = HdfsPath::new(path);
        let mut state = self.lock();
        let _ = self.make_parents(&mut state, &path);
        let node = self.new_node(Some(data.to_vec()), 0o644);
        state.nodes.insert(path, node);
    }

    /// Seeds a directory, creating parents as needed.
    pub fn put_dir(&self, path: &str) {
        let path = HdfsPath::new(path);
        let mut state = self.lock();
        let _ = self.make_parents(&mut state, &path);
        let node = self.new_node(None, 0o755);
        state.nodes.insert(path, node);
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .nodes
            .get(&HdfsPath::new(path))
            .and_then(|n| n.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(&HdfsPath::new(path))
    }

    pub fn perm_of(&self, path: &str) -> Option<u16> {
        self.lock().nodes.get(&HdfsPath::new(path)).map(|n| n.perm)
    }

    pub fn owner_of(&self, path: &str) -> Option<(String, String)> {
        self.lock()
            .nodes
            .get(&HdfsPath::new(path))
            .map(|n| (n.owner.clone(), n.group.clone()))
    }

    pub fn mtime_of(&self, path: &str) -> Option<i64> {
        self.lock().nodes.get(&HdfsPath::new(path)).map(|n| n.mtime)
    }

    /// Number of calls made for `op` (e.g. `"GETFILESTATUS"`).
    pub fn calls(&self, op: &str) -> u64 {
        self.lock()
            .calls
            .iter()
            .filter(|(k, _)| **k == op)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn total_calls(&self) -> u64 {
        self.lock().calls.values().sum()
    }

    /// Makes the next `times` calls of `op` fail with an I/O error.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.lock().failures.insert(op, times);
    }

    /// Makes SETOWNER fail the way a non-superuser request does.
    pub fn reject_ownership_changes(&self, reject: bool) {
        self.lock().reject_ownership = reject;
    }
}

impl Default for MemoryHdfs {
    fn default() -> Self {
        Self::new()
    }
}

impl WebHdfs for MemoryHdfs {
    fn get_file_status(&self, path: &HdfsPath) -> Result<FileStatus> {
        let mut state = self.lock();
        self.enter(&mut state, "GETFILESTATUS", path)?;
        state
            .nodes
            .get(path)
            .map(|n| Self::status_of(path, n, ""))
            .ok_or_else(|| FsError::not_found(path))
    }

    fn list_status(&self, path: &HdfsPath) -> Result<Vec<FileStatus>> {
        let mut state = self.lock();
        self.enter(&mut state, "LISTSTATUS", path)?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| FsError::not_found(path))?;
        if !node.is_dir() {
            return Ok(vec![Self::status_of(path, node, "")]);
        }
        Ok(Self::children(&state, path)
            .map(|(p, n)| Self::status_of(p, n, p.file_name()))
            .collect())
    }

    fn open(&self, path: &HdfsPath, offset: u64, length: u64) -> Result<Bytes> {
        let mut state = self.lock();
        self.enter(&mut state, "OPEN", path)?;
        let data = state
            .nodes
            .get(path)
            .and_then(|n| n.data.as_ref())
            .ok_or_else(|| FsError::not_found(path))?;
        let len = data.len() as u64;
        if offset > len {
            return Err(FsError::internal(format!(
                "Offset={} out of the range [0, {})",
                offset, len
            )));
        }
        let end = offset.saturating_add(length).min(len);
        Ok(Bytes::copy_from_slice(&data[offset as usize..end as usize]))
    }

    fn create(&self, path: &HdfsPath, permission: u16, overwrite: bool, data: Bytes) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "CREATE", path)?;
        if let Some(existing) = state.nodes.get(path) {
            if existing.is_dir() || !overwrite {
                return Err(FsError::AlreadyExists {
                    path: path.to_string(),
                });
            }
        }
        self.make_parents(&mut state, path)?;
        let node = self.new_node(Some(data.to_vec()), permission);
        state.nodes.insert(path.clone(), node);
        Ok(())
    }

    fn append(&self, path: &HdfsPath, data: Bytes) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "APPEND", path)?;
        let node = state
            .nodes
            .get_mut(path)
            .filter(|n| !n.is_dir())
            .ok_or_else(|| FsError::not_found(path))?;
        if let Some(buf) = node.data.as_mut() {
            buf.extend_from_slice(&data);
        }
        node.mtime = now_ms();
        Ok(())
    }

    fn mkdirs(&self, path: &HdfsPath, permission: u16) -> Result<bool> {
        let mut state = self.lock();
        self.enter(&mut state, "MKDIRS", path)?;
        match state.nodes.get(path) {
            Some(n) if n.is_dir() => return Ok(true),
            Some(_) => {
                return Err(FsError::AlreadyExists {
                    path: path.to_string(),
                })
            }
            None => {}
        }
        self.make_parents(&mut state, path)?;
        let node = self.new_node(None, permission);
        state.nodes.insert(path.clone(), node);
        Ok(true)
    }

    fn delete(&self, path: &HdfsPath, recursive: bool) -> Result<bool> {
        let mut state = self.lock();
        self.enter(&mut state, "DELETE", path)?;
        if path.is_root() {
            return Ok(false);
        }
        let is_dir = match state.nodes.get(path) {
            None => return Ok(false),
            Some(n) => n.is_dir(),
        };
        if is_dir {
            let has_children = Self::children(&state, path).next().is_some();
            if has_children && !recursive {
                return Err(FsError::NotEmpty {
                    path: path.to_string(),
                });
            }
        }
        state.nodes.retain(|p, _| !p.is_within(path));
        Ok(true)
    }

    fn rename(&self, src: &HdfsPath, dst: &HdfsPath) -> Result<bool> {
        let mut state = self.lock();
        self.enter(&mut state, "RENAME", src)?;
        if src.is_root() || !state.nodes.contains_key(src) || dst.is_within(src) {
            return Ok(false);
        }
        let target = match state.nodes.get(dst) {
            Some(n) if n.is_dir() => dst.join(src.file_name()),
            Some(_) => return Ok(false),
            None => dst.clone(),
        };
        if state.nodes.contains_key(&target) {
            return Ok(false);
        }
        match state.nodes.get(&target.parent()) {
            Some(n) if n.is_dir() => {}
            _ => return Ok(false),
        }
        let moved: Vec<(HdfsPath, Node)> = state
            .nodes
            .iter()
            .filter(|(p, _)| p.is_within(src))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect();
        for (old, node) in moved {
            state.nodes.remove(&old);
            if let Some(new) = old.rebase(src, &target) {
                state.nodes.insert(new, node);
            }
        }
        Ok(true)
    }

    fn set_permission(&self, path: &HdfsPath, permission: u16) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "SETPERMISSION", path)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| FsError::not_found(path))?;
        node.perm = permission & 0o7777;
        Ok(())
    }

    fn set_owner(&self, path: &HdfsPath, owner: Option<&str>, group: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "SETOWNER", path)?;
        if state.reject_ownership {
            return Err(FsError::PermissionDenied {
                path: path.to_string(),
                op: "SETOWNER".to_string(),
            });
        }
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| FsError::not_found(path))?;
        if let Some(owner) = owner {
            node.owner = owner.to_string();
        }
        if let Some(group) = group {
            node.group = group.to_string();
        }
        Ok(())
    }

    fn set_times(
        &self,
        path: &HdfsPath,
        atime_ms: Option<i64>,
        mtime_ms: Option<i64>,
    ) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "SETTIMES", path)?;
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| FsError::not_found(path))?;
        if let Some(a) = atime_ms {
            node.atime = a;
        }
        if let Some(m) = mtime_ms {
            node.mtime = m;
        }
        Ok(())
    }

    fn content_summary(&self, path: &HdfsPath) -> Result<ContentSummary> {
        let mut state = self.lock();
        self.enter(&mut state, "GETCONTENTSUMMARY", path)?;
        if !state.nodes.contains_key(path) {
            return Err(FsError::not_found(path));
        }
        let mut summary = ContentSummary {
            quota: -1,
            space_quota: -1,
            ..Default::default()
        };
        for (_, node) in state.nodes.iter().filter(|(p, _)| p.is_within(path)) {
            match &node.data {
                Some(d) => {
                    summary.file_count += 1;
                    summary.length += d.len() as u64;
                    summary.space_consumed += 3 * d.len() as u64;
                }
                None => summary.directory_count += 1,
            }
        }
        Ok(summary)
    }
}
