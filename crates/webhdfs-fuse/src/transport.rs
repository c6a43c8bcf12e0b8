//! REST transport for the WebHDFS protocol.
//!
//! Metadata operations are a single request to the NameNode. Data operations
//! (CREATE, APPEND, OPEN) are two requests: the NameNode answers with a
//! `307 Temporary Redirect` whose `Location` names a DataNode, and the data
//! travels in a second request to that DataNode. Both requests form one
//! logical operation and share a single retry budget.

use crate::error::{FsError, Result};
use crate::path::HdfsPath;
use crate::retry::RetryPolicy;
use crate::status::{
    BooleanResponse, ContentSummary, ContentSummaryResponse, FileStatus, FileStatusResponse,
    FileStatusesResponse,
};
use crate::translate::{translate_malformed, translate_response, translate_transport};
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Configuration for the WebHDFS endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub namenode_host: String,
    pub namenode_port: u16,
    pub use_https: bool,
    /// Sent as `user.name` on every request (pseudo authentication).
    pub user: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            namenode_host: String::from("localhost"),
            namenode_port: 50070,
            use_https: false,
            user: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransportConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!(
            "{}://{}:{}/webhdfs/v1",
            scheme, self.namenode_host, self.namenode_port
        )
    }
}

/// The remote operations the filesystem needs. Everything is blocking from
/// the caller's point of view.
pub trait WebHdfs: Send + Sync {
    /// GETFILESTATUS
    fn get_file_status(&self, path: &HdfsPath) -> Result<FileStatus>;
    /// LISTSTATUS
    fn list_status(&self, path: &HdfsPath) -> Result<Vec<FileStatus>>;
    /// OPEN with an explicit byte range; short reads mean end of file.
    fn open(&self, path: &HdfsPath, offset: u64, length: u64) -> Result<Bytes>;
    /// CREATE with the full payload.
    fn create(&self, path: &HdfsPath, permission: u16, overwrite: bool, data: Bytes) -> Result<()>;
    /// APPEND
    fn append(&self, path: &HdfsPath, data: Bytes) -> Result<()>;
    /// MKDIRS
    fn mkdirs(&self, path: &HdfsPath, permission: u16) -> Result<bool>;
    /// DELETE
    fn delete(&self, path: &HdfsPath, recursive: bool) -> Result<bool>;
    /// RENAME
    fn rename(&self, src: &HdfsPath, dst: &HdfsPath) -> Result<bool>;
    /// SETPERMISSION
    fn set_permission(&self, path: &HdfsPath, permission: u16) -> Result<()>;
    /// SETOWNER
    fn set_owner(&self, path: &HdfsPath, owner: Option<&str>, group: Option<&str>) -> Result<()>;
    /// SETTIMES, `None` leaves the timestamp unchanged.
    fn set_times(&self, path: &HdfsPath, atime_ms: Option<i64>, mtime_ms: Option<i64>)
        -> Result<()>;
    /// GETCONTENTSUMMARY
    fn content_summary(&self, path: &HdfsPath) -> Result<ContentSummary>;
}

type Params = Vec<(&'static str, String)>;

/// `WebHdfs` over HTTP using a pooled `reqwest` client driven by a private
/// tokio runtime.
pub struct RestTransport {
    client: reqwest::Client,
    base: Url,
    user: Option<String>,
    retry: RetryPolicy,
    runtime: tokio::runtime::Runtime,
}

impl RestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url())
            .map_err(|e| FsError::internal(format!("invalid namenode address: {}", e)))?;

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("webhdfs-fuse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FsError::internal(format!("failed to build HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("webhdfs-io")
            .enable_all()
            .build()
            .map_err(|e| FsError::internal(format!("failed to start I/O runtime: {}", e)))?;

        tracing::info!(
            "WebHDFS transport targeting {} as {}",
            base,
            config.user.as_deref().unwrap_or("<anonymous>")
        );

        Ok(Self {
            client,
            base,
            user: config.user.clone(),
            retry: config.retry.clone(),
            runtime,
        })
    }

    fn url_for(&self, path: &HdfsPath) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| FsError::internal("namenode URL cannot carry a path"))?;
            segments.pop_if_empty();
            if path.is_root() {
                segments.push("");
            } else {
                segments.extend(path.components());
            }
        }
        Ok(url)
    }

    fn params(&self, op: &'static str, extra: Params) -> Params {
        let mut params = Vec::with_capacity(extra.len() + 2);
        params.push(("op", op.to_string()));
        if let Some(user) = &self.user {
            params.push(("user.name", user.clone()));
        }
        params.extend(extra);
        params
    }

    /// Runs `attempt` until it succeeds, fails permanently, or the retry
    /// budget is spent. Non-idempotent calls get exactly one attempt.
    fn execute<T, F, Fut>(&self, op: &'static str, path: &HdfsPath, idempotent: bool, attempt: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = if idempotent {
            self.retry.clone()
        } else {
            RetryPolicy::none()
        };
        self.runtime.block_on(async {
            let mut n = 1;
            loop {
                match attempt().await {
                    Err(e) if e.is_transient() && policy.should_retry(n) => {
                        let delay = policy.delay_after(n);
                        tracing::debug!(
                            "{} {} attempt {} failed ({}), retrying in {:?}",
                            op,
                            path,
                            n,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        n += 1;
                    }
                    other => return other,
                }
            }
        })
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        params: &[(&'static str, String)],
        body: Option<Bytes>,
        op: &'static str,
        path: &HdfsPath,
    ) -> Result<Response> {
        let mut request = self.client.request(method, url).query(params);
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| translate_transport(op, path, &e))?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(translate_response(op, path, status.as_u16(), &body))
    }

    async fn metadata<T: DeserializeOwned>(
        &self,
        method: Method,
        op: &'static str,
        path: &HdfsPath,
        extra: Params,
    ) -> Result<T> {
        let url = self.url_for(path)?;
        let params = self.params(op, extra);
        let response = self.send(method, url, &params, None, op, path).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| translate_transport(op, path, &e))?;
        serde_json::from_slice(&body).map_err(|e| translate_malformed(op, path, &e.to_string()))
    }

    async fn metadata_empty(
        &self,
        method: Method,
        op: &'static str,
        path: &HdfsPath,
        extra: Params,
    ) -> Result<()> {
        let url = self.url_for(path)?;
        let params = self.params(op, extra);
        self.send(method, url, &params, None, op, path).await?;
        Ok(())
    }

    /// NameNode request without payload, then the payload to the DataNode the
    /// NameNode redirected to.
    async fn redirected(
        &self,
        method: Method,
        op: &'static str,
        path: &HdfsPath,
        extra: Params,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let url = self.url_for(path)?;
        let params = self.params(op, extra);
        let first = self
            .send(method.clone(), url.clone(), &params, None, op, path)
            .await?;

        if !first.status().is_redirection() {
            // HttpFS-style gateways answer reads directly.
            if body.as_ref().map_or(true, |b| b.is_empty()) {
                return Ok(first);
            }
            return Err(translate_malformed(
                op,
                path,
                &format!("expected redirect, got HTTP {}", first.status()),
            ));
        }

        let location = first
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| translate_malformed(op, path, "redirect without Location header"))?;
        let target = url
            .join(location)
            .map_err(|e| translate_malformed(op, path, &format!("bad Location: {}", e)))?;
        tracing::debug!(
            "{} {} redirected to {}:{}",
            op,
            path,
            target.host_str().unwrap_or("?"),
            target.port_or_known_default().unwrap_or(0)
        );

        self.send(method, target, &[], body, op, path).await
    }

    async fn read_range(&self, path: &HdfsPath, offset: u64, length: u64) -> Result<Bytes> {
        let extra = vec![("offset", offset.to_string()), ("length", length.to_string())];
        let response = self.redirected(Method::GET, "OPEN", path, extra, None).await?;
        response
            .bytes()
            .await
            .map_err(|e| translate_transport("OPEN", path, &e))
    }
}

fn octal(permission: u16) -> String {
    format!("{:o}", permission & 0o7777)
}

impl WebHdfs for RestTransport {
    fn get_file_status(&self, path: &HdfsPath) -> Result<FileStatus> {
        self.execute("GETFILESTATUS", path, true, || {
            self.metadata::<FileStatusResponse>(Method::GET, "GETFILESTATUS", path, Vec::new())
        })
        .map(|r| r.file_status)
    }

    fn list_status(&self, path: &HdfsPath) -> Result<Vec<FileStatus>> {
        self.execute("LISTSTATUS", path, true, || {
            self.metadata::<FileStatusesResponse>(Method::GET, "LISTSTATUS", path, Vec::new())
        })
        .map(|r| r.file_statuses.file_status)
    }

    fn open(&self, path: &HdfsPath, offset: u64, length: u64) -> Result<Bytes> {
        self.execute("OPEN", path, true, || self.read_range(path, offset, length))
    }

    fn create(&self, path: &HdfsPath, permission: u16, overwrite: bool, data: Bytes) -> Result<()> {
        let len = data.len();
        let extra = vec![
            ("overwrite", overwrite.to_string()),
            ("permission", octal(permission)),
        ];
        self.execute("CREATE", path, false, || {
            self.redirected(Method::PUT, "CREATE", path, extra.clone(), Some(data.clone()))
        })?;
        tracing::debug!("CREATE {} committed {} bytes", path, len);
        Ok(())
    }

    fn append(&self, path: &HdfsPath, data: Bytes) -> Result<()> {
        let len = data.len();
        self.execute("APPEND", path, false, || {
            self.redirected(Method::POST, "APPEND", path, Vec::new(), Some(data.clone()))
        })?;
        tracing::debug!("APPEND {} committed {} bytes", path, len);
        Ok(())
    }

    fn mkdirs(&self, path: &HdfsPath, permission: u16) -> Result<bool> {
        self.execute("MKDIRS", path, false, || {
            self.metadata::<BooleanResponse>(
                Method::PUT,
                "MKDIRS",
                path,
                vec![("permission", octal(permission))],
            )
        })
        .map(|r| r.boolean)
    }

    fn delete(&self, path: &HdfsPath, recursive: bool) -> Result<bool> {
        self.execute("DELETE", path, false, || {
            self.metadata::<BooleanResponse>(
                Method::DELETE,
                "DELETE",
                path,
                vec![("recursive", recursive.to_string())],
            )
        })
        .map(|r| r.boolean)
    }

    fn rename(&self, src: &HdfsPath, dst: &HdfsPath) -> Result<bool> {
        self.execute("RENAME", src, false, || {
            self.metadata::<BooleanResponse>(
                Method::PUT,
                "RENAME",
                src,
                vec![("destination", dst.to_string())],
            )
        })
        .map(|r| r.boolean)
    }

    fn set_permission(&self, path: &HdfsPath, permission: u16) -> Result<()> {
        self.execute("SETPERMISSION", path, false, || {
            self.metadata_empty(
                Method::PUT,
                "SETPERMISSION",
                path,
                vec![("permission", octal(permission))],
            )
        })
    }

    fn set_owner(&self, path: &HdfsPath, owner: Option<&str>, group: Option<&str>) -> Result<()> {
        let mut extra: Params = Vec::new();
        if let Some(owner) = owner {
            extra.push(("owner", owner.to_string()));
        }
        if let Some(group) = group {
            extra.push(("group", group.to_string()));
        }
        self.execute("SETOWNER", path, false, || {
            self.metadata_empty(Method::PUT, "SETOWNER", path, extra.clone())
        })
    }

    fn set_times(
        &self,
        path: &HdfsPath,
        atime_ms: Option<i64>,
        mtime_ms: Option<i64>,
    ) -> Result<()> {
        let extra = vec![
            ("accesstime", atime_ms.unwrap_or(-1).to_string()),
            ("modificationtime", mtime_ms.unwrap_or(-1).to_string()),
        ];
        self.execute("SETTIMES", path, false, || {
            self.metadata_empty(Method::PUT, "SETTIMES", path, extra.clone())
        })
    }

    fn content_summary(&self, path: &HdfsPath) -> Result<ContentSummary> {
        self.execute("GETCONTENTSUMMARY", path, true, || {
            self.metadata::<ContentSummaryResponse>(
                Method::GET,
                "GETCONTENTSUMMARY",
                path,
                Vec::new(),
            )
        })
        .map(|r| r.content_summary)
    }
}
