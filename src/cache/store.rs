//! Local content cache, validated against the server by etag.
//!
//! Layout: `<dir>/<uuid>.bin` holds node content, `<dir>/<uuid>.etag` the
//! version token for those bytes. Both are replaced by writing a
//! temporary file in the same directory and renaming it over the
//! canonical path, so a reader never observes partial content. The two
//! renames are independent; a crash between them leaves a stale sidecar,
//! which only costs one extra fetch later.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::api::{IoClient, ReadOutcome};
use crate::error::FsError;

const CONTENT_EXT: &str = "bin";
const ETAG_EXT: &str = "etag";

/// Per-node blob cache on local storage.
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the cache holds current content for `uuid`, returning an
    /// open read/write handle on it.
    pub fn refresh(&self, uuid: &str, path: &str, client: &IoClient) -> Result<File, FsError> {
        let validator = self.read_etag(uuid);
        match client.read_content(path, validator.as_deref())? {
            ReadOutcome::NotModified => {
                tracing::debug!(uuid, "content not modified, keeping cache");
                self.open_content(uuid)
            }
            ReadOutcome::Fetched { mut body, etag } => {
                tracing::debug!(uuid, etag = ?etag, "content changed, replacing cache");
                self.apply_fetch(uuid, &mut body, etag.as_deref())
            }
        }
    }

    /// Stream fresh content into place and record its etag.
    ///
    /// Factored from [`CacheStore::refresh`] so the atomic-replace logic
    /// is exercisable with an in-memory body.
    pub fn apply_fetch(
        &self,
        uuid: &str,
        body: &mut impl Read,
        etag: Option<&str>,
    ) -> Result<File, FsError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        io::copy(body, tmp.as_file_mut())?;
        tmp.persist(self.content_path(uuid))
            .map_err(|e| FsError::Io(e.error))?;
        match etag {
            Some(etag) => self.store_etag(uuid, etag)?,
            // a leftover sidecar must not validate the new bytes
            None => self.remove_etag(uuid)?,
        }
        self.open_content(uuid)
    }

    /// Atomically replace the sidecar with a new version token.
    pub fn store_etag(&self, uuid: &str, etag: &str) -> Result<(), FsError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.as_file_mut().write_all(etag.as_bytes())?;
        tmp.persist(self.etag_path(uuid))
            .map_err(|e| FsError::Io(e.error))?;
        Ok(())
    }

    /// Stored version token, if both cache files can be consulted.
    pub fn read_etag(&self, uuid: &str) -> Option<String> {
        if !self.content_path(uuid).exists() {
            return None;
        }
        fs::read_to_string(self.etag_path(uuid))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Open existing cached content read/write.
    pub fn open_content(&self, uuid: &str) -> Result<File, FsError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.content_path(uuid))?)
    }

    /// Create a brand-new, exclusive content file for a freshly created
    /// node. A collision means local state is inconsistent.
    pub fn create_exclusive(&self, uuid: &str) -> Result<File, FsError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.content_path(uuid))
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    FsError::AlreadyExists
                } else {
                    FsError::Io(e)
                }
            })
    }

    /// Drop a node's content and sidecar. Missing files are fine.
    pub fn remove(&self, uuid: &str) -> io::Result<()> {
        for path in [self.content_path(uuid), self.etag_path(uuid)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Every cached content file, as `(uuid, path)` pairs.
    pub fn content_entries(&self) -> io::Result<Vec<(String, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONTENT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                entries.push((stem.to_string(), path.clone()));
            }
        }
        Ok(entries)
    }

    fn remove_etag(&self, uuid: &str) -> Result<(), FsError> {
        match fs::remove_file(self.etag_path(uuid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::Io(e)),
        }
    }

    fn content_path(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", uuid, CONTENT_EXT))
    }

    fn etag_path(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", uuid, ETAG_EXT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    fn read_content(store: &CacheStore, uuid: &str) -> Vec<u8> {
        fs::read(store.content_path(uuid)).unwrap()
    }

    #[test]
    fn apply_fetch_writes_body_and_etag() {
        let (_dir, store) = store();

        let mut body = Cursor::new(b"hello world".to_vec());
        store.apply_fetch("u1", &mut body, Some("v1")).unwrap();

        assert_eq!(read_content(&store, "u1"), b"hello world");
        assert_eq!(store.read_etag("u1").as_deref(), Some("v1"));
    }

    #[test]
    fn apply_fetch_leaves_no_temp_files() {
        let (_dir, store) = store();

        let mut body = Cursor::new(b"payload".to_vec());
        store.apply_fetch("u1", &mut body, Some("v1")).unwrap();

        let mut names: Vec<String> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["u1.bin", "u1.etag"]);
    }

    #[test]
    fn apply_fetch_replaces_previous_content() {
        let (_dir, store) = store();

        let mut body = Cursor::new(b"first".to_vec());
        store.apply_fetch("u1", &mut body, Some("v1")).unwrap();
        let mut body = Cursor::new(b"second version".to_vec());
        store.apply_fetch("u1", &mut body, Some("v2")).unwrap();

        assert_eq!(read_content(&store, "u1"), b"second version");
        assert_eq!(store.read_etag("u1").as_deref(), Some("v2"));
    }

    #[test]
    fn apply_fetch_without_etag_keeps_content_usable() {
        let (_dir, store) = store();

        let mut body = Cursor::new(b"data".to_vec());
        store.apply_fetch("u1", &mut body, None).unwrap();

        assert_eq!(read_content(&store, "u1"), b"data");
        assert_eq!(store.read_etag("u1"), None);
    }

    #[test]
    fn apply_fetch_without_etag_clears_stale_sidecar() {
        let (_dir, store) = store();

        let mut body = Cursor::new(b"first".to_vec());
        store.apply_fetch("u1", &mut body, Some("v1")).unwrap();
        assert_eq!(store.read_etag("u1").as_deref(), Some("v1"));

        // new bytes, no version token: the old sidecar would otherwise
        // produce a false 304 on the next refresh
        let mut body = Cursor::new(b"second".to_vec());
        store.apply_fetch("u1", &mut body, None).unwrap();

        assert_eq!(read_content(&store, "u1"), b"second");
        assert_eq!(store.read_etag("u1"), None);
        assert!(!store.etag_path("u1").exists());
    }

    #[test]
    fn etag_ignored_when_content_missing() {
        let (_dir, store) = store();
        store.store_etag("ghost", "v9").unwrap();
        assert_eq!(store.read_etag("ghost"), None);
    }

    #[test]
    fn create_exclusive_rejects_collision() {
        let (_dir, store) = store();

        store.create_exclusive("u1").unwrap();
        let err = store.create_exclusive("u1").unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = store();

        let mut body = Cursor::new(b"x".to_vec());
        store.apply_fetch("u1", &mut body, Some("v1")).unwrap();

        store.remove("u1").unwrap();
        store.remove("u1").unwrap();
        assert!(store.content_entries().unwrap().is_empty());
    }

    #[test]
    fn content_entries_lists_only_content_files() {
        let (_dir, store) = store();

        let mut body = Cursor::new(b"x".to_vec());
        store.apply_fetch("aaa", &mut body, Some("v1")).unwrap();
        let mut body = Cursor::new(b"y".to_vec());
        store.apply_fetch("bbb", &mut body, None).unwrap();

        let mut uuids: Vec<String> = store
            .content_entries()
            .unwrap()
            .into_iter()
            .map(|(uuid, _)| uuid)
            .collect();
        uuids.sort();
        assert_eq!(uuids, vec!["aaa", "bbb"]);
    }
}
