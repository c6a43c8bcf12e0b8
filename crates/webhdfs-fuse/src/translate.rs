//! Maps WebHDFS failures onto [`FsError`].
//!
//! Resolution order: the Java exception simple name (table below), then
//! message patterns for the generic `IOException`, then the HTTP status.
//! Every input resolves to exactly one kind.

use crate::error::FsError;
use crate::path::HdfsPath;
use crate::status::{RemoteException, RemoteExceptionResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    AlreadyExists,
    NotADirectory,
    NotEmpty,
    PermissionDenied,
    Io,
    Unsupported,
    Internal,
}

const EXCEPTION_TABLE: &[(&str, ErrorClass)] = &[
    ("FileNotFoundException", ErrorClass::NotFound),
    ("FileAlreadyExistsException", ErrorClass::AlreadyExists),
    ("ParentNotDirectoryException", ErrorClass::NotADirectory),
    ("PathIsNotDirectoryException", ErrorClass::NotADirectory),
    ("PathIsNotEmptyDirectoryException", ErrorClass::NotEmpty),
    ("AccessControlException", ErrorClass::PermissionDenied),
    ("SecurityException", ErrorClass::PermissionDenied),
    ("AuthorizationException", ErrorClass::PermissionDenied),
    ("UnsupportedOperationException", ErrorClass::Unsupported),
    ("UnresolvedPathException", ErrorClass::Unsupported),
    ("StandbyException", ErrorClass::Io),
    ("RetriableException", ErrorClass::Io),
    ("SafeModeException", ErrorClass::Io),
    ("AlreadyBeingCreatedException", ErrorClass::Io),
    ("LeaseExpiredException", ErrorClass::Io),
    ("RecoveryInProgressException", ErrorClass::Io),
    ("DSQuotaExceededException", ErrorClass::Io),
    ("NSQuotaExceededException", ErrorClass::Io),
    ("QuotaExceededException", ErrorClass::Io),
    ("IllegalArgumentException", ErrorClass::Internal),
    ("InvalidPathException", ErrorClass::Internal),
    ("NumberFormatException", ErrorClass::Internal),
];

const MESSAGE_TABLE: &[(&str, ErrorClass)] = &[
    (" is non empty", ErrorClass::NotEmpty),
    ("Directory is not empty", ErrorClass::NotEmpty),
    ("does not exist", ErrorClass::NotFound),
    ("File not found", ErrorClass::NotFound),
    ("already exists", ErrorClass::AlreadyExists),
    ("Permission denied", ErrorClass::PermissionDenied),
    ("is not a directory", ErrorClass::NotADirectory),
];

impl ErrorClass {
    pub fn into_error(self, op: &str, path: &HdfsPath, reason: &str) -> FsError {
        let path = path.to_string();
        match self {
            ErrorClass::NotFound => FsError::NotFound { path },
            ErrorClass::AlreadyExists => FsError::AlreadyExists { path },
            ErrorClass::NotADirectory => FsError::NotADirectory { path },
            ErrorClass::NotEmpty => FsError::NotEmpty { path },
            ErrorClass::PermissionDenied => FsError::PermissionDenied {
                path,
                op: op.to_string(),
            },
            ErrorClass::Io => FsError::Io {
                reason: format!("{} {}: {}", op, path, reason),
            },
            ErrorClass::Unsupported => FsError::Unsupported { op: op.to_string() },
            ErrorClass::Internal => FsError::Internal {
                reason: format!("{} {}: {}", op, path, reason),
            },
        }
    }
}

/// Strips a Java package prefix: `java.io.FileNotFoundException` -> `FileNotFoundException`.
fn simple_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

pub fn classify_exception(ex: &RemoteException) -> Option<ErrorClass> {
    let candidates = [simple_name(&ex.exception), simple_name(&ex.java_class_name)];
    for name in candidates {
        if let Some((_, class)) = EXCEPTION_TABLE.iter().find(|(n, _)| *n == name) {
            return Some(*class);
        }
    }
    MESSAGE_TABLE
        .iter()
        .find(|(pattern, _)| ex.message.contains(pattern))
        .map(|(_, class)| *class)
}

pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        404 | 410 => ErrorClass::NotFound,
        401 | 403 => ErrorClass::PermissionDenied,
        409 => ErrorClass::AlreadyExists,
        405 | 501 => ErrorClass::Unsupported,
        408 | 429 => ErrorClass::Io,
        500..=599 => ErrorClass::Io,
        _ => ErrorClass::Internal,
    }
}

/// Translates a non-success HTTP response.
pub fn translate_response(op: &str, path: &HdfsPath, status: u16, body: &[u8]) -> FsError {
    let remote = serde_json::from_slice::<RemoteExceptionResponse>(body)
        .ok()
        .map(|r| r.remote_exception);

    let (class, reason) = match &remote {
        Some(ex) => (
            classify_exception(ex).unwrap_or_else(|| classify_status(status)),
            format!("{}: {}", ex.exception, ex.message),
        ),
        None => (
            classify_status(status),
            format!("HTTP {}", status),
        ),
    };

    tracing::warn!(
        "WebHDFS {} {} failed with HTTP {} ({}), reported as {:?}",
        op,
        path,
        status,
        reason,
        class
    );
    class.into_error(op, path, &reason)
}

/// Translates a failure that happened before a response was received, or
/// while reading one.
pub fn translate_transport(op: &str, path: &HdfsPath, err: &reqwest::Error) -> FsError {
    let class = if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ErrorClass::Io
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16())
    } else if err.is_decode() {
        ErrorClass::Internal
    } else {
        ErrorClass::Io
    };
    tracing::warn!("WebHDFS {} {} transport failure: {}", op, path, err);
    class.into_error(op, path, &err.to_string())
}

/// A success response whose body could not be understood.
pub fn translate_malformed(op: &str, path: &HdfsPath, detail: &str) -> FsError {
    tracing::warn!("WebHDFS {} {} returned malformed body: {}", op, path, detail);
    ErrorClass::Internal.into_error(op, path, detail)
}
