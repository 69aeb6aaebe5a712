//! Kernel filesystem callbacks.
//!
//! Each request resolves the inode to a path, then composes the
//! reference table and protocol client. Content reads and writes never
//! touch the network here; they go straight to the cache file held by
//! the live reference.

use std::ffi::OsStr;
use std::fs::FileTimes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::api::types::{NodeKind, StatResponse, XattrMode};
use crate::api::IoClient;
use crate::error::FsError;
use crate::fuse::inode_table::{self, InodeTable, ROOT_INO};
use crate::fuse::ref_table::RefTable;

/// Namespace every remote extended attribute lives under. Keys outside
/// it are answered locally, without a remote call.
pub const XATTR_PREFIX: &str = "repo.";

const ATTR_TTL: Duration = Duration::from_secs(1);
const STATFS_BLOCK_SIZE: u32 = 4096;

pub struct RepoFs {
    client: Arc<IoClient>,
    refs: Arc<RefTable>,
    inodes: Mutex<InodeTable>,
}

impl RepoFs {
    pub fn new(client: Arc<IoClient>, refs: Arc<RefTable>) -> Self {
        Self {
            client,
            refs,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.lock().path_of(ino).map(str::to_string)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        let inodes = self.inodes.lock();
        let dir = inodes.path_of(parent)?;
        Some(inode_table::join(dir, name))
    }

    /// Attributes for a path: the local cache file when a live reference
    /// exists, remote stat otherwise.
    fn attr_for(&self, ino: u64, path: &str) -> Result<FileAttr, FsError> {
        if let Some(meta) = self
            .refs
            .with_live(path, |r| r.file().metadata())
            .transpose()?
        {
            return Ok(local_attr(ino, &meta));
        }
        let stat = self.client.stat(path)?;
        Ok(remote_attr(ino, &stat))
    }
}

/// Gate an extended-attribute key on the recognized namespace. Keys
/// outside it are answered here, before any remote call can happen.
fn check_xattr_key(key: &str) -> Result<(), FsError> {
    if key.starts_with(XATTR_PREFIX) {
        Ok(())
    } else {
        Err(FsError::AttributeNotFound)
    }
}

/// Inode for a lookup target, minting one when the path is unseen.
/// Reports whether the mint was fresh so a failed stat can undo it.
fn assign_for_lookup(inodes: &Mutex<InodeTable>, path: &str) -> (u64, bool) {
    let mut inodes = inodes.lock();
    match inodes.ino_of(path) {
        Some(ino) => (ino, false),
        None => (inodes.assign(path), true),
    }
}

fn file_type(mode: u32) -> FileType {
    if mode & libc::S_IFMT == libc::S_IFDIR {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

fn epoch(sec: Option<i64>) -> SystemTime {
    match sec {
        Some(s) if s >= 0 => UNIX_EPOCH + Duration::from_secs(s as u64),
        _ => UNIX_EPOCH,
    }
}

fn remote_attr(ino: u64, stat: &StatResponse) -> FileAttr {
    let mtime = epoch(stat.st_mtime_epoch_sec);
    FileAttr {
        ino,
        size: stat.st_size,
        blocks: stat.st_blocks,
        atime: epoch(stat.st_atime_epoch_sec),
        mtime,
        ctime: epoch(stat.st_ctime_epoch_sec),
        crtime: mtime,
        kind: file_type(stat.st_mode),
        perm: (stat.st_mode & 0o7777) as u16,
        nlink: stat.st_nlink,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: stat.st_blksize,
        flags: 0,
    }
}

fn local_attr(ino: u64, meta: &std::fs::Metadata) -> FileAttr {
    use std::os::unix::fs::MetadataExt;

    let mtime = epoch(Some(meta.mtime()));
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: epoch(Some(meta.atime())),
        mtime,
        ctime: epoch(Some(meta.ctime())),
        crtime: mtime,
        kind: FileType::RegularFile,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: 1,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn time_parts(t: TimeOrNow) -> (i64, i64) {
    let st = match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    };
    match st.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
        Err(_) => (0, 0),
    }
}

fn system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for RepoFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!("filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let (ino, minted) = assign_for_lookup(&self.inodes, &path);
        match self.attr_for(ino, &path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                // a failed lookup of an absent name must not grow the table
                if minted {
                    self.inodes.lock().forget_path(&path);
                }
                reply.error(e.errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.attr_for(ino, &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        if let Some(size) = size {
            // local truncate on a live reference, remote action otherwise
            let local = self.refs.with_live(&path, |r| {
                r.file().set_len(size)?;
                r.mark_dirty();
                Ok::<_, std::io::Error>(())
            });
            let result = match local {
                Some(r) => r.map_err(FsError::from),
                None => self.client.truncate(&path, size),
            };
            if let Err(e) = result {
                reply.error(e.errno());
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let local = self.refs.with_live(&path, |r| {
                let mut times = FileTimes::new();
                if let Some(t) = atime {
                    times = times.set_accessed(system_time(t));
                }
                if let Some(t) = mtime {
                    times = times.set_modified(system_time(t));
                }
                r.file().set_times(times)
            });
            let result = match local {
                Some(r) => r.map_err(FsError::from),
                None => {
                    let now = TimeOrNow::Now;
                    self.client.utimens(
                        &path,
                        time_parts(atime.unwrap_or(now)),
                        time_parts(mtime.unwrap_or(now)),
                    )
                }
            };
            if let Err(e) = result {
                reply.error(e.errno());
                return;
            }
        }

        match self.attr_for(ino, &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        if let Err(e) = self.client.create(&path, NodeKind::Folder, mode, None) {
            reply.error(e.errno());
            return;
        }
        let ino = self.inodes.lock().assign(&path);
        match self.attr_for(ino, &path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        match self.client.unlink(&path) {
            Ok(()) => {
                self.inodes.lock().forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        match self.client.rmdir(&path) {
            Ok(()) => {
                self.inodes.lock().forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old, new) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Some(o), Some(n)) => (o, n),
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        match self.client.rename(&old, &new) {
            Ok(()) => {
                self.inodes.lock().reassign(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.refs.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let fh = match self.refs.create(&path, mode, flags) {
            Ok(fh) => fh,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let ino = self.inodes.lock().assign(&path);
        match self.attr_for(ino, &path) {
            Ok(attr) => reply.created(&ATTR_TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.refs.read_at(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.refs.write_at(fh, offset as u64, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.errno()),
        }
    }

    // writeback is deferred entirely to release
    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.refs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let listing = match self.client.readdir(&path) {
            Ok(l) => l,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(listing.dirents.len() + 2);
        {
            let mut inodes = self.inodes.lock();
            let parent_ino = if ino == ROOT_INO {
                ROOT_INO
            } else {
                inodes.assign(&inode_table::parent_of(&path))
            };
            entries.push((ino, FileType::Directory, ".".to_string()));
            entries.push((parent_ino, FileType::Directory, "..".to_string()));
            for d in &listing.dirents {
                let child = inode_table::join(&path, &d.name);
                let child_ino = inodes.assign(&child);
                entries.push((child_ino, file_type(d.kind), d.name.clone()));
            }
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // next offset is i + 1 so the kernel can resume past this entry
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.client.statfs() {
            Ok(usage) => {
                let free = usage.free_bytes.parse::<u64>().unwrap_or(0);
                let total = usage.total_bytes.parse::<u64>().unwrap_or(0);
                let bsize = u64::from(STATFS_BLOCK_SIZE);
                reply.statfs(
                    total / bsize,
                    free / bsize,
                    free / bsize,
                    0,
                    0,
                    STATFS_BLOCK_SIZE,
                    usage.max_filename,
                    STATFS_BLOCK_SIZE,
                );
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (path, key) = match self.path_of(ino).zip(name.to_str()) {
            Some(pk) => pk,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if let Err(e) = check_xattr_key(key) {
            reply.error(e.errno());
            return;
        }
        match self
            .client
            .xattr_set(&path, key, value, XattrMode::from_flags(flags))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let (path, key) = match self.path_of(ino).zip(name.to_str()) {
            Some(pk) => pk,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if let Err(e) = check_xattr_key(key) {
            reply.error(e.errno());
            return;
        }
        let value = match self.client.xattr_get(&path, key) {
            Ok(Some(v)) => v,
            Ok(None) => {
                reply.error(FsError::AttributeNotFound.errno());
                return;
            }
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let bytes = value.as_bytes();
        if size == 0 {
            reply.size(bytes.len() as u32);
        } else if (size as usize) < bytes.len() {
            reply.error(libc::ERANGE);
        } else {
            reply.data(bytes);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let keys = match self.client.xattr_list(&path) {
            Ok(k) => k,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let mut bytes = Vec::new();
        for key in keys.iter().filter(|k| k.starts_with(XATTR_PREFIX)) {
            bytes.extend_from_slice(key.as_bytes());
            bytes.push(0);
        }
        if size == 0 {
            reply.size(bytes.len() as u32);
        } else if (size as usize) < bytes.len() {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&bytes);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let (path, key) = match self.path_of(ino).zip(name.to_str()) {
            Some(pk) => pk,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        if let Err(e) = check_xattr_key(key) {
            reply.error(e.errno());
            return;
        }
        match self.client.xattr_remove(&path, key) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }
}
