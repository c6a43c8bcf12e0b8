//! Mountpoint validation and kernel mount options.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Mount options for FUSE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Allow other users to access the mount (needs `user_allow_other`).
    pub allow_other: bool,
    /// Unmount when the process exits.
    pub auto_unmount: bool,
    /// Mount read-only; the kernel rejects writes before they reach us.
    pub read_only: bool,
    /// How long the kernel may cache attributes and entries.
    pub kernel_ttl_ms: u64,
    /// Name shown in the mount table.
    pub fs_name: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            allow_other: false,
            auto_unmount: true,
            read_only: false,
            kernel_ttl_ms: 1_000,
            fs_name: String::from("webhdfs"),
        }
    }
}

impl MountOptions {
    pub fn kernel_ttl(&self) -> Duration {
        Duration::from_millis(self.kernel_ttl_ms)
    }
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

pub fn validate_mountpoint(path: &Path) -> Result<(), MountError> {
    if !path.exists() {
        return Err(MountError::PathNotFound(path.display().to_string()));
    }
    if !path.is_dir() {
        return Err(MountError::NotADirectory(path.display().to_string()));
    }
    Ok(())
}

/// Parses a comma-separated `-o` style list on top of `base`.
pub fn parse_mount_options(opts_str: &str, base: MountOptions) -> Result<MountOptions, MountError> {
    let mut options = base;
    for opt in opts_str.split(',').map(str::trim) {
        match opt {
            "" => {}
            "allow_other" => options.allow_other = true,
            "auto_unmount" => options.auto_unmount = true,
            "ro" => options.read_only = true,
            "rw" => options.read_only = false,
            other => match other.split_once('=') {
                Some(("fsname", name)) if !name.is_empty() => options.fs_name = name.to_string(),
                Some(("kernel_ttl_ms", ms)) => {
                    options.kernel_ttl_ms = ms
                        .parse()
                        .map_err(|_| MountError::InvalidOption(other.to_string()))?
                }
                _ => return Err(MountError::InvalidOption(other.to_string())),
            },
        }
    }
    Ok(options)
}

pub fn options_to_fuser(opts: &MountOptions) -> Vec<fuser::MountOption> {
    let mut fuser_opts = vec![
        fuser::MountOption::FSName(opts.fs_name.clone()),
        fuser::MountOption::Subtype("webhdfs".to_string()),
    ];
    if opts.allow_other {
        fuser_opts.push(fuser::MountOption::AllowOther);
    }
    if opts.auto_unmount {
        fuser_opts.push(fuser::MountOption::AutoUnmount);
    }
    fuser_opts.push(if opts.read_only {
        fuser::MountOption::RO
    } else {
        fuser::MountOption::RW
    });
    fuser_opts
}
