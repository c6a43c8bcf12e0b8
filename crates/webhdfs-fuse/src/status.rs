//! WebHDFS JSON response bodies.
//!
//! Field names follow the REST API documentation; unknown fields are ignored
//! so newer NameNodes that add attributes stay readable.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileStatusType {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    #[serde(default)]
    pub access_time: i64,
    #[serde(default)]
    pub block_size: u64,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub modification_time: i64,
    #[serde(default)]
    pub owner: String,
    /// Empty for GETFILESTATUS, the child name for LISTSTATUS entries.
    #[serde(default)]
    pub path_suffix: String,
    /// Octal string, e.g. `"755"` or `"1777"`.
    pub permission: String,
    #[serde(default)]
    pub replication: u16,
    #[serde(rename = "type")]
    pub kind: FileStatusType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children_num: Option<u64>,
}

impl FileStatus {
    /// Permission bits parsed from the octal string; malformed values read as 0.
    pub fn permission_bits(&self) -> u16 {
        u16::from_str_radix(self.permission.trim(), 8).unwrap_or(0) & 0o7777
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileStatusResponse {
    pub file_status: FileStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileStatusesResponse {
    pub file_statuses: FileStatusList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileStatusList {
    #[serde(default)]
    pub file_status: Vec<FileStatus>,
}

#[derive(Debug, Deserialize)]
pub struct BooleanResponse {
    pub boolean: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSummary {
    #[serde(default)]
    pub directory_count: u64,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub length: u64,
    #[serde(default = "unlimited")]
    pub quota: i64,
    #[serde(default)]
    pub space_consumed: u64,
    #[serde(default = "unlimited")]
    pub space_quota: i64,
}

fn unlimited() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContentSummaryResponse {
    pub content_summary: ContentSummary,
}

/// Body of every WebHDFS error response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteExceptionResponse {
    pub remote_exception: RemoteException,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteException {
    pub exception: String,
    #[serde(default)]
    pub java_class_name: String,
    #[serde(default)]
    pub message: String,
}
