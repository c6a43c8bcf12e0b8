use thiserror::Error;

/// Every failure the filesystem can report. The first eight variants are the
/// closed set remote failures are translated into; `IsADirectory` and
/// `BadHandle` are only raised by local checks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FsError {
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    #[error("Already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("Permission denied for {path}, operation: {op}")]
    PermissionDenied { path: String, op: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Operation not supported: {op}")]
    Unsupported { op: String },

    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error("Is a directory: {path}")]
    IsADirectory { path: String },

    #[error("Bad file handle: {fh}")]
    BadHandle { fh: u64 },
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn not_found(path: impl ToString) -> Self {
        FsError::NotFound {
            path: path.to_string(),
        }
    }

    pub fn io(reason: impl ToString) -> Self {
        FsError::Io {
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(op: impl ToString) -> Self {
        FsError::Unsupported { op: op.to_string() }
    }

    pub fn internal(reason: impl ToString) -> Self {
        FsError::Internal {
            reason: reason.to_string(),
        }
    }

    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FsError::NotFound { .. } => ENOENT,
            FsError::AlreadyExists { .. } => EEXIST,
            FsError::NotADirectory { .. } => ENOTDIR,
            FsError::NotEmpty { .. } => ENOTEMPTY,
            FsError::PermissionDenied { op, .. } if op == "chmod" || op == "chown" => EPERM,
            FsError::PermissionDenied { .. } => EACCES,
            FsError::Io { .. } => EIO,
            FsError::Unsupported { .. } => EOPNOTSUPP,
            FsError::Internal { .. } => EREMOTEIO,
            FsError::IsADirectory { .. } => EISDIR,
            FsError::BadHandle { .. } => EBADF,
        }
    }

    /// Transport-level failures are the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_errno() {
        assert_eq!(FsError::not_found("/x").to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_permission_denied_errno_depends_on_op() {
        let read = FsError::PermissionDenied {
            path: "/x".into(),
            op: "read".into(),
        };
        let chown = FsError::PermissionDenied {
            path: "/x".into(),
            op: "chown".into(),
        };
        assert_eq!(read.to_errno(), libc::EACCES);
        assert_eq!(chown.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_unsupported_errno() {
        assert_eq!(FsError::unsupported("symlink").to_errno(), libc::EOPNOTSUPP);
    }

    #[test]
    fn test_remaining_errnos() {
        let cases = [
            (FsError::AlreadyExists { path: "/a".into() }, libc::EEXIST),
            (FsError::NotADirectory { path: "/a".into() }, libc::ENOTDIR),
            (FsError::NotEmpty { path: "/a".into() }, libc::ENOTEMPTY),
            (FsError::io("timeout"), libc::EIO),
            (FsError::internal("weird"), libc::EREMOTEIO),
            (FsError::IsADirectory { path: "/a".into() }, libc::EISDIR),
            (FsError::BadHandle { fh: 9 }, libc::EBADF),
        ];
        for (err, errno) in cases {
            assert_eq!(err.to_errno(), errno, "{}", err);
        }
    }

    #[test]
    fn test_only_io_is_transient() {
        assert!(FsError::io("reset").is_transient());
        assert!(!FsError::not_found("/x").is_transient());
        assert!(!FsError::internal("x").is_transient());
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            FsError::not_found("/a"),
            FsError::io("x"),
            FsError::unsupported("y"),
            FsError::BadHandle { fh: 1 },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
