//! In-process mock NameNode/DataNode for integration tests.
//!
//! One axum server plays both roles: requests under `/webhdfs/v1` are the
//! NameNode, which answers data operations with a 307 pointing at the same
//! server under `/datanode/webhdfs/v1`.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use webhdfs_fuse::retry::RetryPolicy;
use webhdfs_fuse::transport::TransportConfig;

const NAMENODE_PREFIX: &str = "/webhdfs/v1";
const DATANODE_PREFIX: &str = "/datanode/webhdfs/v1";

#[derive(Debug, Clone)]
struct Node {
    dir: bool,
    data: Vec<u8>,
    perm: u16,
    owner: String,
    group: String,
    mtime: i64,
    atime: i64,
}

/// One request as seen by the mock.
#[derive(Debug, Clone)]
pub struct Logged {
    pub op: String,
    pub datanode: bool,
    pub user: Option<String>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    log: Vec<Logged>,
    failures: HashMap<(String, bool), u32>,
}

type Shared = Arc<Mutex<Inner>>;

struct ServerState {
    addr: SocketAddr,
    inner: Shared,
}

pub struct MockNameNode {
    addr: SocketAddr,
    inner: Shared,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, n)| n).unwrap_or(path)
}

fn is_within(path: &str, root: &str) -> bool {
    root == "/" || path == root || path.starts_with(&format!("{}/", root))
}

fn hdfs_path(raw: &str) -> String {
    format!("/{}", raw.trim_matches('/'))
}

fn remote_exception(status: StatusCode, exception: &str, message: String) -> Response {
    let body = json!({
        "RemoteException": {
            "exception": exception,
            "javaClassName": format!("org.apache.hadoop.{}", exception),
            "message": message,
        }
    });
    (status, Json(body)).into_response()
}

fn not_found(path: &str) -> Response {
    remote_exception(
        StatusCode::NOT_FOUND,
        "FileNotFoundException",
        format!("File does not exist: {}", path),
    )
}

fn boolean(value: bool) -> Response {
    Json(json!({ "boolean": value })).into_response()
}

fn file_status(node: &Node, suffix: &str) -> Value {
    json!({
        "accessTime": node.atime,
        "blockSize": if node.dir { 0 } else { 134_217_728u64 },
        "group": node.group,
        "length": if node.dir { 0 } else { node.data.len() },
        "modificationTime": node.mtime,
        "owner": node.owner,
        "pathSuffix": suffix,
        "permission": format!("{:o}", node.perm),
        "replication": if node.dir { 0 } else { 3 },
        "type": if node.dir { "DIRECTORY" } else { "FILE" },
    })
}

fn parse_perm(q: &HashMap<String, String>, default: u16) -> u16 {
    q.get("permission")
        .and_then(|p| u16::from_str_radix(p, 8).ok())
        .unwrap_or(default)
}

impl Inner {
    fn owner(q: &HashMap<String, String>) -> String {
        q.get("user.name").cloned().unwrap_or_else(|| "dr.who".to_string())
    }

    fn node(dir: bool, perm: u16, owner: String) -> Node {
        let now = now_ms();
        Node {
            dir,
            data: Vec::new(),
            perm,
            owner,
            group: "supergroup".to_string(),
            mtime: now,
            atime: now,
        }
    }

    fn make_parents(&mut self, path: &str, owner: &str) {
        let mut current = parent_of(path).to_string();
        let mut missing = Vec::new();
        while current != "/" && !self.nodes.contains_key(&current) {
            missing.push(current.clone());
            current = parent_of(&current).to_string();
        }
        for dir in missing {
            self.nodes.insert(dir, Self::node(true, 0o755, owner.to_string()));
        }
    }

    fn children(&self, dir: &str) -> Vec<(String, Node)> {
        self.nodes
            .iter()
            .filter(|(p, _)| p.as_str() != dir && parent_of(p) == dir)
            .map(|(p, n)| (name_of(p).to_string(), n.clone()))
            .collect()
    }

    fn take_failure(&mut self, op: &str, datanode: bool) -> bool {
        match self.failures.get_mut(&(op.to_string(), datanode)) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn namenode(
        &mut self,
        addr: SocketAddr,
        method: &Method,
        uri: &Uri,
        path: &str,
        q: &HashMap<String, String>,
    ) -> Response {
        let op = q.get("op").map(String::as_str).unwrap_or("");
        let flag = |name: &str| q.get(name).map(|v| v == "true").unwrap_or(false);
        let redirect = || {
            let suffix = &uri.path()[NAMENODE_PREFIX.len()..];
            let location = format!(
                "http://{}{}{}?{}",
                addr,
                DATANODE_PREFIX,
                suffix,
                uri.query().unwrap_or("")
            );
            (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response()
        };

        match (method.as_str(), op) {
            ("GET", "GETFILESTATUS") => match self.nodes.get(path) {
                Some(node) => Json(json!({ "FileStatus": file_status(node, "") })).into_response(),
                None => not_found(path),
            },
            ("GET", "LISTSTATUS") => match self.nodes.get(path) {
                None => not_found(path),
                Some(node) if !node.dir => Json(json!({
                    "FileStatuses": { "FileStatus": [file_status(node, "")] }
                }))
                .into_response(),
                Some(_) => {
                    let entries: Vec<Value> = self
                        .children(path)
                        .iter()
                        .map(|(name, node)| file_status(node, name))
                        .collect();
                    Json(json!({ "FileStatuses": { "FileStatus": entries } })).into_response()
                }
            },
            ("GET", "GETCONTENTSUMMARY") => {
                if !self.nodes.contains_key(path) {
                    return not_found(path);
                }
                let (mut dirs, mut files, mut length) = (0u64, 0u64, 0u64);
                for (p, node) in &self.nodes {
                    if !is_within(p, path) {
                        continue;
                    }
                    if node.dir {
                        dirs += 1;
                    } else {
                        files += 1;
                        length += node.data.len() as u64;
                    }
                }
                Json(json!({
                    "ContentSummary": {
                        "directoryCount": dirs,
                        "fileCount": files,
                        "length": length,
                        "quota": -1,
                        "spaceConsumed": length * 3,
                        "spaceQuota": -1,
                    }
                }))
                .into_response()
            }
            ("GET", "OPEN") => match self.nodes.get(path) {
                Some(node) if !node.dir => redirect(),
                _ => not_found(path),
            },
            ("PUT", "CREATE") => match self.nodes.get(path) {
                Some(node) if node.dir || !flag("overwrite") => remote_exception(
                    StatusCode::FORBIDDEN,
                    "FileAlreadyExistsException",
                    format!("{} already exists", path),
                ),
                _ => redirect(),
            },
            ("POST", "APPEND") => match self.nodes.get(path) {
                Some(node) if !node.dir => redirect(),
                _ => not_found(path),
            },
            ("PUT", "MKDIRS") => {
                match self.nodes.get(path) {
                    Some(node) if node.dir => return boolean(true),
                    Some(_) => {
                        return remote_exception(
                            StatusCode::FORBIDDEN,
                            "FileAlreadyExistsException",
                            format!("{} is not a directory", path),
                        )
                    }
                    None => {}
                }
                let owner = Self::owner(q);
                self.make_parents(path, &owner);
                let node = Self::node(true, parse_perm(q, 0o755), owner);
                self.nodes.insert(path.to_string(), node);
                boolean(true)
            }
            ("DELETE", "DELETE") => {
                let Some(node) = self.nodes.get(path) else {
                    return boolean(false);
                };
                if path == "/" {
                    return boolean(false);
                }
                if node.dir && !flag("recursive") && !self.children(path).is_empty() {
                    return remote_exception(
                        StatusCode::FORBIDDEN,
                        "PathIsNotEmptyDirectoryException",
                        format!("`{} is non empty': Directory is not empty", path),
                    );
                }
                self.nodes.retain(|p, _| !is_within(p, path));
                boolean(true)
            }
            ("PUT", "RENAME") => {
                let dst = match q.get("destination") {
                    Some(d) => hdfs_path(d),
                    None => {
                        return remote_exception(
                            StatusCode::BAD_REQUEST,
                            "IllegalArgumentException",
                            "destination is required".to_string(),
                        )
                    }
                };
                let dst_parent_ok = self
                    .nodes
                    .get(parent_of(&dst))
                    .map(|n| n.dir)
                    .unwrap_or(false);
                if !self.nodes.contains_key(path)
                    || self.nodes.contains_key(&dst)
                    || !dst_parent_ok
                    || is_within(&dst, path)
                {
                    return boolean(false);
                }
                let moved: Vec<String> = self
                    .nodes
                    .keys()
                    .filter(|p| is_within(p, path))
                    .cloned()
                    .collect();
                for old in moved {
                    if let Some(node) = self.nodes.remove(&old) {
                        let new = format!("{}{}", dst, &old[path.len()..]);
                        self.nodes.insert(new, node);
                    }
                }
                boolean(true)
            }
            ("PUT", "SETPERMISSION") => match self.nodes.get_mut(path) {
                Some(node) => {
                    node.perm = parse_perm(q, node.perm);
                    StatusCode::OK.into_response()
                }
                None => not_found(path),
            },
            ("PUT", "SETOWNER") => match self.nodes.get_mut(path) {
                Some(node) => {
                    if let Some(owner) = q.get("owner") {
                        node.owner = owner.clone();
                    }
                    if let Some(group) = q.get("group") {
                        node.group = group.clone();
                    }
                    StatusCode::OK.into_response()
                }
                None => not_found(path),
            },
            ("PUT", "SETTIMES") => match self.nodes.get_mut(path) {
                Some(node) => {
                    let get = |k: &str| q.get(k).and_then(|v| v.parse::<i64>().ok()).unwrap_or(-1);
                    if get("modificationtime") >= 0 {
                        node.mtime = get("modificationtime");
                    }
                    if get("accesstime") >= 0 {
                        node.atime = get("accesstime");
                    }
                    StatusCode::OK.into_response()
                }
                None => not_found(path),
            },
            _ => remote_exception(
                StatusCode::BAD_REQUEST,
                "IllegalArgumentException",
                format!("Invalid value for webhdfs parameter \"op\": {}", op),
            ),
        }
    }

    fn datanode(&mut self, method: &Method, path: &str, q: &HashMap<String, String>, body: Bytes) -> Response {
        let op = q.get("op").map(String::as_str).unwrap_or("");
        match (method.as_str(), op) {
            ("PUT", "CREATE") => {
                let owner = Self::owner(q);
                self.make_parents(path, &owner);
                let mut node = Self::node(false, parse_perm(q, 0o644), owner);
                node.data = body.to_vec();
                self.nodes.insert(path.to_string(), node);
                StatusCode::CREATED.into_response()
            }
            ("POST", "APPEND") => match self.nodes.get_mut(path) {
                Some(node) if !node.dir => {
                    node.data.extend_from_slice(&body);
                    node.mtime = now_ms();
                    StatusCode::OK.into_response()
                }
                _ => not_found(path),
            },
            ("GET", "OPEN") => match self.nodes.get(path) {
                Some(node) if !node.dir => {
                    let len = node.data.len();
                    let offset = q
                        .get("offset")
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0)
                        .min(len);
                    let length = q
                        .get("length")
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(len);
                    let end = offset.saturating_add(length).min(len);
                    (StatusCode::OK, node.data[offset..end].to_vec()).into_response()
                }
                _ => not_found(path),
            },
            _ => StatusCode::BAD_REQUEST.into_response(),
        }
    }
}

async fn namenode_root(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    dispatch(&state, false, "/", &method, &uri, &q, body)
}

async fn namenode(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    dispatch(&state, false, &hdfs_path(&path), &method, &uri, &q, body)
}

async fn datanode(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    Query(q): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    dispatch(&state, true, &hdfs_path(&path), &method, &uri, &q, body)
}

fn dispatch(
    state: &ServerState,
    datanode: bool,
    path: &str,
    method: &Method,
    uri: &Uri,
    q: &HashMap<String, String>,
    body: Bytes,
) -> Response {
    let op = q.get("op").cloned().unwrap_or_default();
    let mut inner = match state.inner.lock() {
        Ok(inner) => inner,
        Err(poisoned) => poisoned.into_inner(),
    };
    inner.log.push(Logged {
        op: op.clone(),
        datanode,
        user: q.get("user.name").cloned(),
    });
    if inner.take_failure(&op, datanode) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if datanode {
        inner.datanode(method, path, q, body)
    } else {
        inner.namenode(state.addr, method, uri, path, q)
    }
}

impl MockNameNode {
    /// Starts the server on an ephemeral port with `/user/x` present.
    pub fn start() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind mock namenode");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");

        let inner: Shared = Arc::new(Mutex::new(Inner::default()));
        {
            let mut guard = inner.lock().unwrap();
            guard
                .nodes
                .insert("/".to_string(), Inner::node(true, 0o755, "hdfs".to_string()));
        }
        let state = Arc::new(ServerState {
            addr,
            inner: Arc::clone(&inner),
        });

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("mock runtime");
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).expect("tokio listener");
                let router = Router::new()
                    .route(NAMENODE_PREFIX, any(namenode_root))
                    .route(&format!("{}/", NAMENODE_PREFIX), any(namenode_root))
                    .route(&format!("{}/*path", NAMENODE_PREFIX), any(namenode))
                    .route(&format!("{}/*path", DATANODE_PREFIX), any(datanode))
                    .with_state(state);
                let _ = axum::serve(listener, router.into_make_service()).await;
            });
        });

        let mock = MockNameNode { addr, inner };
        mock.put_dir("/user/x");
        mock
    }

    pub fn transport_config(&self, user: Option<&str>) -> TransportConfig {
        TransportConfig {
            namenode_host: self.addr.ip().to_string(),
            namenode_port: self.addr.port(),
            user: user.map(String::from),
            connect_timeout_ms: 1_000,
            request_timeout_ms: 5_000,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn put_dir(&self, path: &str) {
        let mut inner = self.lock();
        inner.make_parents(path, "hdfs");
        inner
            .nodes
            .insert(path.to_string(), Inner::node(true, 0o755, "hdfs".to_string()));
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        let mut inner = self.lock();
        inner.make_parents(path, "hdfs");
        let mut node = Inner::node(false, 0o644, "hdfs".to_string());
        node.data = data.to_vec();
        inner.nodes.insert(path.to_string(), node);
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .nodes
            .get(path)
            .filter(|n| !n.dir)
            .map(|n| n.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    pub fn perm_of(&self, path: &str) -> Option<u16> {
        self.lock().nodes.get(path).map(|n| n.perm)
    }

    pub fn owner_of(&self, path: &str) -> Option<(String, String)> {
        self.lock()
            .nodes
            .get(path)
            .map(|n| (n.owner.clone(), n.group.clone()))
    }

    pub fn mtime_of(&self, path: &str) -> Option<i64> {
        self.lock().nodes.get(path).map(|n| n.mtime)
    }

    /// NameNode requests seen for `op`.
    pub fn namenode_calls(&self, op: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|l| !l.datanode && l.op == op)
            .count()
    }

    /// DataNode requests seen for `op`.
    pub fn datanode_calls(&self, op: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|l| l.datanode && l.op == op)
            .count()
    }

    pub fn last_request(&self) -> Option<Logged> {
        self.lock().log.last().cloned()
    }

    /// Answers the next `times` NameNode requests for `op` with HTTP 503.
    pub fn fail_namenode(&self, op: &str, times: u32) {
        self.lock().failures.insert((op.to_string(), false), times);
    }

    /// Answers the next `times` DataNode requests for `op` with HTTP 503.
    pub fn fail_datanode(&self, op: &str, times: u32) {
        self.lock().failures.insert((op.to_string(), true), times);
    }
}
