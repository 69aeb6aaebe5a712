//! Wire DTOs for the remote I/O service.
//!
//! Field names mirror the JSON the service emits; numeric byte counts in
//! the statfs reply arrive as decimal strings.

use serde::{Deserialize, Serialize};

/// `GET /stat` response.
#[derive(Debug, Clone, Deserialize)]
pub struct StatResponse {
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_blksize: u32,
    pub st_blocks: u64,
    pub st_size: u64,
    pub st_atime_epoch_sec: Option<i64>,
    pub st_mtime_epoch_sec: Option<i64>,
    pub st_ctime_epoch_sec: Option<i64>,
}

/// One entry of a `GET /readdir` response.
#[derive(Debug, Clone, Deserialize)]
pub struct Dirent {
    pub name: String,
    /// st_mode-style type bits.
    #[serde(rename = "type")]
    pub kind: u32,
}

/// `GET /readdir` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaddirResponse {
    pub total: u64,
    pub dirents: Vec<Dirent>,
}

/// `POST /open` request body.
#[derive(Debug, Clone, Serialize)]
pub struct OpenRequest<'a> {
    pub path: &'a str,
    pub base: &'a str,
    pub flags: i32,
}

/// `POST /open` and `POST /create` responses.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeResponse {
    pub uuid: String,
}

/// Remote node kind for `POST /create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Content,
    Folder,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Content => "content",
            NodeKind::Folder => "folder",
        }
    }
}

/// `POST /create` request body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRequest<'a> {
    pub path: &'a str,
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub base: &'a str,
    pub mode: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<i32>,
}

/// `PUT /write` response.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteResponse {
    pub etag: String,
}

/// `POST /rename` request body.
#[derive(Debug, Clone, Serialize)]
pub struct RenameRequest<'a> {
    pub newpath: &'a str,
}

/// `POST /truncate` request body.
#[derive(Debug, Clone, Serialize)]
pub struct TruncateRequest {
    pub offset: u64,
}

/// `GET /statfs` response.
#[derive(Debug, Clone, Deserialize)]
pub struct StatfsResponse {
    #[serde(rename = "freeBytes")]
    pub free_bytes: String,
    #[serde(rename = "totalBytes")]
    pub total_bytes: String,
    #[serde(rename = "maxFilename")]
    pub max_filename: u32,
}

/// `POST /utimens` request body. Seconds and nanoseconds travel as
/// decimal strings.
#[derive(Debug, Clone, Serialize)]
pub struct UtimensRequest {
    pub atime_sec: String,
    pub atime_nsec: String,
    pub mtime_sec: String,
    pub mtime_nsec: String,
}

/// `GET /xattr` (single key) response.
#[derive(Debug, Clone, Deserialize)]
pub struct XattrResponse {
    pub value: Option<String>,
}

/// Update mode for `POST /xattr`, from the setxattr flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrMode {
    Create,
    Replace,
    CreateOrReplace,
}

impl XattrMode {
    pub fn from_flags(flags: i32) -> Self {
        if flags & libc::XATTR_CREATE == libc::XATTR_CREATE {
            XattrMode::Create
        } else if flags & libc::XATTR_REPLACE == libc::XATTR_REPLACE {
            XattrMode::Replace
        } else {
            XattrMode::CreateOrReplace
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            XattrMode::Create => "create",
            XattrMode::Replace => "replace",
            XattrMode::CreateOrReplace => "createorreplace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statfs_parses_string_byte_counts() {
        let json = r#"{"freeBytes":"1048576","totalBytes":"4194304","maxFilename":255}"#;
        let resp: StatfsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.free_bytes.parse::<u64>().unwrap(), 1_048_576);
        assert_eq!(resp.max_filename, 255);
    }

    #[test]
    fn dirent_type_field_renames() {
        let json = r#"{"total":1,"dirents":[{"name":"a.txt","type":33188}]}"#;
        let resp: ReaddirResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.dirents[0].name, "a.txt");
        assert_eq!(resp.dirents[0].kind & libc::S_IFMT, libc::S_IFREG);
    }

    #[test]
    fn stat_times_are_optional() {
        let json = r#"{"st_mode":16877,"st_nlink":2,"st_blksize":4096,
                       "st_blocks":8,"st_size":4096}"#;
        let resp: StatResponse = serde_json::from_str(json).unwrap();
        assert!(resp.st_mtime_epoch_sec.is_none());
    }

    #[test]
    fn xattr_mode_from_flags() {
        assert_eq!(XattrMode::from_flags(libc::XATTR_CREATE), XattrMode::Create);
        assert_eq!(
            XattrMode::from_flags(libc::XATTR_REPLACE),
            XattrMode::Replace
        );
        assert_eq!(XattrMode::from_flags(0), XattrMode::CreateOrReplace);
    }

    #[test]
    fn create_request_omits_absent_flags() {
        let req = CreateRequest {
            path: "/d",
            kind: NodeKind::Folder.as_str(),
            base: "b",
            mode: 0o755,
            flags: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("flags"));
        assert!(json.contains(r#""type":"folder""#));
    }
}
