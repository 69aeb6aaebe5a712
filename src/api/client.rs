//! Blocking JSON/HTTP client for the remote I/O service.
//!
//! One remote filesystem action per call, single attempt, no retries.
//! Each call borrows a transport handle from the pool for its duration;
//! the guard puts it back on every exit path. Failures are classified
//! into [`FsError`] here and nowhere else.

use std::fs::File;
use std::io;
use std::sync::Arc;

use reqwest::blocking::Response;
use reqwest::header;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use super::error::classify_response;
use super::pool::ClientPool;
use super::types::{
    CreateRequest, NodeKind, NodeResponse, OpenRequest, ReaddirResponse, RenameRequest,
    StatResponse, StatfsResponse, TruncateRequest, UtimensRequest, WriteResponse, XattrMode,
    XattrResponse,
};
use crate::config::MountConfig;
use crate::error::FsError;

/// Outcome of a conditional content fetch.
pub enum ReadOutcome {
    /// Server confirmed the local copy is current.
    NotModified,
    /// Fresh content; the response body streams the bytes.
    Fetched {
        body: Response,
        etag: Option<String>,
    },
}

/// Client for one mounted repository.
#[derive(Debug)]
pub struct IoClient {
    endpoint: String,
    mount_base: String,
    userid: String,
    password: String,
    pool: Arc<ClientPool>,
}

impl IoClient {
    pub fn new(config: &MountConfig, pool: Arc<ClientPool>) -> Self {
        Self {
            endpoint: config.endpoint(),
            mount_base: config.mount_base.clone(),
            userid: config.userid.clone(),
            password: config.password.clone(),
            pool,
        }
    }

    pub fn stat(&self, path: &str) -> Result<StatResponse, FsError> {
        let url = self.node_url("stat", path, &[])?;
        self.get_json(url)
    }

    pub fn readdir(&self, path: &str) -> Result<ReaddirResponse, FsError> {
        let url = self.node_url("readdir", path, &[])?;
        self.get_json(url)
    }

    /// Open a node, returning its stable uuid.
    pub fn open(&self, path: &str, flags: i32) -> Result<String, FsError> {
        let url = self.action_url("open", &[])?;
        let body = OpenRequest {
            path,
            base: &self.mount_base,
            flags,
        };
        let resp: NodeResponse = self.post_json(url, &body)?;
        Ok(resp.uuid)
    }

    /// Create a node, returning its freshly assigned uuid.
    pub fn create(
        &self,
        path: &str,
        kind: NodeKind,
        mode: u32,
        flags: Option<i32>,
    ) -> Result<String, FsError> {
        let url = self.action_url("create", &[])?;
        let body = CreateRequest {
            path,
            kind: kind.as_str(),
            base: &self.mount_base,
            mode,
            flags,
        };
        let resp: NodeResponse = self.post_json(url, &body)?;
        Ok(resp.uuid)
    }

    /// Conditionally fetch node content, streaming on change.
    pub fn read_content(&self, path: &str, validator: Option<&str>) -> Result<ReadOutcome, FsError> {
        let url = self.node_url("read", path, &[])?;
        let handle = self.pool.acquire()?;
        let mut req = handle
            .client()
            .get(url.clone())
            .basic_auth(&self.userid, Some(&self.password));
        if let Some(etag) = validator {
            req = req.header(header::IF_NONE_MATCH, format!("\"{}\"", etag));
        }
        tracing::debug!(url = %url, validator = ?validator, "fetching content");

        let resp = req.send()?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(ReadOutcome::NotModified);
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(classify_response(status, &body));
        }
        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(unquote_etag);
        Ok(ReadOutcome::Fetched { body: resp, etag })
    }

    /// Upload the whole local copy of a node, replacing remote content.
    pub fn upload(
        &self,
        path: &str,
        size: u64,
        mtime_sec: i64,
        content: File,
    ) -> Result<WriteResponse, FsError> {
        let url = self.node_url(
            "write",
            path,
            &[
                ("size", size.to_string()),
                ("offset", "0".to_string()),
                ("truncate", "true".to_string()),
                ("mtime_sec", mtime_sec.to_string()),
            ],
        )?;
        tracing::debug!(url = %url, size, "uploading content");

        let handle = self.pool.acquire()?;
        let resp = handle
            .client()
            .put(url)
            .basic_auth(&self.userid, Some(&self.password))
            .body(content)
            .send()?;
        Self::into_json(resp)
    }

    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        let url = self.node_url("unlink", path, &[])?;
        self.delete(url)
    }

    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let url = self.node_url("rmdir", path, &[])?;
        self.delete(url)
    }

    pub fn rename(&self, path: &str, newpath: &str) -> Result<(), FsError> {
        let url = self.node_url("rename", path, &[])?;
        let _: serde_json::Value = self.post_json(url, &RenameRequest { newpath })?;
        Ok(())
    }

    pub fn truncate(&self, path: &str, offset: u64) -> Result<(), FsError> {
        let url = self.node_url("truncate", path, &[])?;
        let _: serde_json::Value = self.post_json(url, &TruncateRequest { offset })?;
        Ok(())
    }

    pub fn statfs(&self) -> Result<StatfsResponse, FsError> {
        let url = self.action_url("statfs", &[])?;
        self.get_json(url)
    }

    pub fn utimens(&self, path: &str, atime: (i64, i64), mtime: (i64, i64)) -> Result<(), FsError> {
        let url = self.node_url("utimens", path, &[])?;
        let body = UtimensRequest {
            atime_sec: atime.0.to_string(),
            atime_nsec: atime.1.to_string(),
            mtime_sec: mtime.0.to_string(),
            mtime_nsec: mtime.1.to_string(),
        };
        let _: serde_json::Value = self.post_json(url, &body)?;
        Ok(())
    }

    pub fn xattr_get(&self, path: &str, key: &str) -> Result<Option<String>, FsError> {
        let url = self.node_url("xattr", path, &[("key", key.to_string())])?;
        let resp: XattrResponse = self.get_json(url)?;
        Ok(resp.value)
    }

    pub fn xattr_set(
        &self,
        path: &str,
        key: &str,
        value: &[u8],
        mode: XattrMode,
    ) -> Result<(), FsError> {
        let url = self.node_url(
            "xattr",
            path,
            &[
                ("key", key.to_string()),
                ("mode", mode.as_str().to_string()),
            ],
        )?;
        tracing::debug!(url = %url, "setting xattr");

        let handle = self.pool.acquire()?;
        let resp = handle
            .client()
            .post(url)
            .basic_auth(&self.userid, Some(&self.password))
            .header(header::CONTENT_TYPE, "text/plain;charset=utf8")
            .body(value.to_vec())
            .send()?;
        let _: serde_json::Value = Self::into_json(resp)?;
        Ok(())
    }

    pub fn xattr_list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let url = self.node_url("xattr", path, &[("mode", "onlykeys".to_string())])?;
        self.get_json(url)
    }

    pub fn xattr_remove(&self, path: &str, key: &str) -> Result<(), FsError> {
        let url = self.node_url("xattr", path, &[("key", key.to_string())])?;
        self.delete(url)
    }

    /// URL for an action addressed at a node: `base` and `path` plus any
    /// action-specific pairs, all percent-encoded.
    fn node_url(&self, action: &str, path: &str, extra: &[(&str, String)]) -> Result<Url, FsError> {
        let mut params: Vec<(&str, &str)> =
            vec![("base", self.mount_base.as_str()), ("path", path)];
        params.extend(extra.iter().map(|(k, v)| (*k, v.as_str())));
        self.parse_url(action, &params)
    }

    /// URL for an action with no node address (open, create, statfs).
    fn action_url(&self, action: &str, params: &[(&str, &str)]) -> Result<Url, FsError> {
        self.parse_url(action, params)
    }

    fn parse_url(&self, action: &str, params: &[(&str, &str)]) -> Result<Url, FsError> {
        let base = format!("{}/{}", self.endpoint, action);
        let url = if params.is_empty() {
            Url::parse(&base)
        } else {
            Url::parse_with_params(&base, params.iter().copied())
        };
        url.map_err(|e| {
            FsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad endpoint url: {}", e),
            ))
        })
    }

    fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FsError> {
        tracing::debug!(url = %url, "remote get");
        let handle = self.pool.acquire()?;
        let resp = self.authed(handle.client().get(url)).send()?;
        Self::into_json(resp)
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        url: Url,
        body: &impl Serialize,
    ) -> Result<T, FsError> {
        tracing::debug!(url = %url, "remote post");
        let handle = self.pool.acquire()?;
        let resp = self.authed(handle.client().post(url)).json(body).send()?;
        Self::into_json(resp)
    }

    fn delete(&self, url: Url) -> Result<(), FsError> {
        tracing::debug!(url = %url, "remote delete");
        let handle = self.pool.acquire()?;
        let resp = self.authed(handle.client().delete(url)).send()?;
        let _: serde_json::Value = Self::into_json(resp)?;
        Ok(())
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        req.basic_auth(&self.userid, Some(&self.password))
    }

    fn into_json<T: DeserializeOwned>(resp: Response) -> Result<T, FsError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp.json::<T>()?)
        } else {
            let body = resp.text().unwrap_or_default();
            Err(classify_response(status, &body))
        }
    }
}

/// Strip the surrounding quoting an HTTP etag header carries.
fn unquote_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unquote_strips_quotes_and_whitespace() {
        assert_eq!(unquote_etag("\"abc123\""), "abc123");
        assert_eq!(unquote_etag(" \"abc123\""), "abc123");
        assert_eq!(unquote_etag("abc123"), "abc123");
    }
}
