//! Registry of open files.
//!
//! One [`FileRef`] exists per open path, shared by every kernel file
//! handle on it. The table owns open counting, dirty tracking, and the
//! write-back that runs when the last handle goes away. All structural
//! mutation happens under a single exclusive lock; reads and writes on an
//! already-resolved entry use positioned I/O on the cache file without
//! touching the lock. The dirty flag is only ever set outside the lock,
//! and only cleared together with the entry itself, so the relaxed
//! access cannot lose an upload.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::types::NodeKind;
use crate::api::IoClient;
use crate::cache::{CacheStore, LiveUuids};
use crate::error::FsError;

/// Remote and cache operations the table needs for open, create, and
/// release. Split out so the lifecycle logic is testable without a
/// server.
pub trait ContentBackend: Send + Sync {
    /// Remote open; returns the node's stable uuid.
    fn open_node(&self, path: &str, flags: i32) -> Result<String, FsError>;
    /// Remote create of a content node; returns the new uuid.
    fn create_node(&self, path: &str, mode: u32, flags: i32) -> Result<String, FsError>;
    /// Ensure current cached content for `uuid`, returning an open handle.
    fn fetch_content(&self, uuid: &str, path: &str) -> Result<File, FsError>;
    /// Brand-new exclusive cache file for a freshly created node.
    fn create_content(&self, uuid: &str) -> Result<File, FsError>;
    /// Upload local content and record the resulting version token.
    fn write_back(
        &self,
        path: &str,
        uuid: &str,
        content: File,
        size: u64,
        mtime_sec: i64,
    ) -> Result<(), FsError>;
}

/// Production backend: protocol client plus content cache.
pub struct RemoteBackend {
    client: Arc<IoClient>,
    cache: Arc<CacheStore>,
}

impl RemoteBackend {
    pub fn new(client: Arc<IoClient>, cache: Arc<CacheStore>) -> Self {
        Self { client, cache }
    }
}

impl ContentBackend for RemoteBackend {
    fn open_node(&self, path: &str, flags: i32) -> Result<String, FsError> {
        self.client.open(path, flags)
    }

    fn create_node(&self, path: &str, mode: u32, flags: i32) -> Result<String, FsError> {
        self.client.create(path, NodeKind::Content, mode, Some(flags))
    }

    fn fetch_content(&self, uuid: &str, path: &str) -> Result<File, FsError> {
        self.cache.refresh(uuid, path, &self.client)
    }

    fn create_content(&self, uuid: &str) -> Result<File, FsError> {
        self.cache.create_exclusive(uuid)
    }

    fn write_back(
        &self,
        path: &str,
        uuid: &str,
        content: File,
        size: u64,
        mtime_sec: i64,
    ) -> Result<(), FsError> {
        let resp = self.client.upload(path, size, mtime_sec, content)?;
        self.cache.store_etag(uuid, &resp.etag)
    }
}

/// In-memory record of one open file.
pub struct FileRef {
    uuid: String,
    path: String,
    file: File,
    dirty: AtomicBool,
}

impl FileRef {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }
}

struct Slot {
    file_ref: Arc<FileRef>,
    opens: i64,
}

#[derive(Default)]
struct Inner {
    by_path: HashMap<String, Slot>,
    by_handle: HashMap<u64, Arc<FileRef>>,
}

/// Path-keyed table of open files, handing out opaque u64 handles.
pub struct RefTable {
    inner: Mutex<Inner>,
    next_handle: AtomicU64,
    backend: Arc<dyn ContentBackend>,
}

impl RefTable {
    pub fn new(backend: Arc<dyn ContentBackend>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_handle: AtomicU64::new(1),
            backend,
        }
    }

    /// Open `path`, reusing the live reference when one exists.
    ///
    /// The table lock is held across the remote open on a miss so two
    /// concurrent first-opens of the same path cannot both insert.
    pub fn open(&self, path: &str, flags: i32) -> Result<u64, FsError> {
        let mut inner = self.inner.lock();

        let hit = match inner.by_path.get_mut(path) {
            Some(slot) => {
                slot.opens += 1;
                tracing::debug!(path, opens = slot.opens, "reference hit");
                Some(Arc::clone(&slot.file_ref))
            }
            None => None,
        };
        if let Some(file_ref) = hit {
            return Ok(self.register_handle(&mut inner, file_ref));
        }

        tracing::debug!(path, "reference miss, opening remote node");
        let uuid = self.backend.open_node(path, flags)?;
        let file = self.backend.fetch_content(&uuid, path)?;
        let file_ref = Arc::new(FileRef {
            uuid,
            path: path.to_string(),
            file,
            dirty: AtomicBool::new(false),
        });
        inner.by_path.insert(
            path.to_string(),
            Slot {
                file_ref: Arc::clone(&file_ref),
                opens: 1,
            },
        );
        Ok(self.register_handle(&mut inner, file_ref))
    }

    /// Create a content node remotely and register it with a fresh,
    /// exclusive local cache file.
    pub fn create(&self, path: &str, mode: u32, flags: i32) -> Result<u64, FsError> {
        let uuid = self.backend.create_node(path, mode, flags)?;

        let mut inner = self.inner.lock();
        if inner.by_path.contains_key(path) {
            tracing::error!(path, "live reference found during create");
            return Err(FsError::AlreadyExists);
        }
        let file = self.backend.create_content(&uuid)?;
        let file_ref = Arc::new(FileRef {
            uuid,
            path: path.to_string(),
            file,
            dirty: AtomicBool::new(false),
        });
        inner.by_path.insert(
            path.to_string(),
            Slot {
                file_ref: Arc::clone(&file_ref),
                opens: 1,
            },
        );
        Ok(self.register_handle(&mut inner, file_ref))
    }

    /// Drop one handle. When the open count reaches zero the entry is
    /// removed and, if dirty, uploaded first; an upload failure is logged
    /// and the dirty content discarded with the entry.
    pub fn release(&self, fh: u64) -> Result<(), FsError> {
        let mut inner = self.inner.lock();

        let file_ref = inner.by_handle.remove(&fh).ok_or_else(|| {
            tracing::error!(fh, "release of unknown handle");
            FsError::InvalidState(format!("unknown file handle {}", fh))
        })?;
        let path = file_ref.path().to_string();

        let opens = match inner.by_path.get_mut(&path) {
            Some(slot) => {
                slot.opens -= 1;
                slot.opens
            }
            None => {
                tracing::error!(path, "release without table entry");
                return Err(FsError::InvalidState(format!("no entry for {}", path)));
            }
        };

        if opens < 0 {
            tracing::error!(path, opens, "open count dropped negative");
            return Err(FsError::InvalidState(format!(
                "open count {} for {}",
                opens, path
            )));
        }
        if opens > 0 {
            tracing::debug!(path, opens, "reference still held");
            return Ok(());
        }

        inner.by_path.remove(&path);
        if file_ref.is_dirty() {
            if let Err(e) = self.upload(&file_ref) {
                // deliberate best effort: the entry goes away either way
                tracing::warn!(path, error = %e, "writeback failed, dropping dirty content");
            }
        } else {
            tracing::debug!(path, "clean release, no writeback");
        }
        Ok(())
    }

    /// Positioned read through a handle. Short only at end of file.
    pub fn read_at(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        let file_ref = self.resolve(fh)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file_ref.file().read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Positioned write through a handle; marks the entry dirty.
    pub fn write_at(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let file_ref = self.resolve(fh)?;
        file_ref.mark_dirty();
        let mut written = 0;
        while written < data.len() {
            let n = file_ref
                .file()
                .write_at(&data[written..], offset + written as u64)?;
            if n == 0 {
                return Err(FsError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "cache file refused bytes",
                )));
            }
            written += n;
        }
        Ok(data.len() as u32)
    }

    /// Run `f` against the live reference for `path`, if any. The table
    /// lock is dropped before `f` runs.
    pub fn with_live<R>(&self, path: &str, f: impl FnOnce(&FileRef) -> R) -> Option<R> {
        let file_ref = {
            let inner = self.inner.lock();
            inner.by_path.get(path).map(|s| Arc::clone(&s.file_ref))
        };
        file_ref.map(|r| f(&r))
    }

    fn resolve(&self, fh: u64) -> Result<Arc<FileRef>, FsError> {
        self.inner
            .lock()
            .by_handle
            .get(&fh)
            .cloned()
            .ok_or_else(|| FsError::InvalidState(format!("unknown file handle {}", fh)))
    }

    fn register_handle(&self, inner: &mut Inner, file_ref: Arc<FileRef>) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::SeqCst);
        inner.by_handle.insert(fh, file_ref);
        fh
    }

    fn upload(&self, file_ref: &FileRef) -> Result<(), FsError> {
        let meta = file_ref.file().metadata()?;
        let mut content = file_ref.file().try_clone()?;
        content.seek(SeekFrom::Start(0))?;
        tracing::debug!(path = file_ref.path(), size = meta.size(), "uploading on release");
        self.backend
            .write_back(file_ref.path(), file_ref.uuid(), content, meta.size(), meta.mtime())
    }

    #[cfg(test)]
    fn open_count(&self, path: &str) -> Option<i64> {
        self.inner.lock().by_path.get(path).map(|s| s.opens)
    }

    #[cfg(test)]
    fn force_open_count(&self, path: &str, opens: i64) {
        if let Some(slot) = self.inner.lock().by_path.get_mut(path) {
            slot.opens = opens;
        }
    }
}

impl LiveUuids for RefTable {
    fn live_uuids(&self) -> HashSet<String> {
        self.inner
            .lock()
            .by_path
            .values()
            .map(|s| s.file_ref.uuid().to_string())
            .collect()
    }
}
