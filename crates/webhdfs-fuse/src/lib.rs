#![warn(missing_docs)]

//! WebHDFS FUSE driver.
//!
//! Presents a remote HDFS namespace, reached over the WebHDFS REST API, as a
//! local filesystem. The kernel adapter in [`filesystem`] resolves inodes to
//! paths and hands each call to the [`dispatcher`], which combines the
//! [`cache`], the open [`handle`] table and the REST [`transport`].

pub mod attr;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filesystem;
pub mod handle;
pub mod idmap;
pub mod inode;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod mount;
pub mod path;
pub mod retry;
pub mod status;
pub mod translate;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use error::{FsError, Result};
pub use path::HdfsPath;
pub use transport::{RestTransport, WebHdfs};
