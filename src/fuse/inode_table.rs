//! Inode ⇄ path translation.
//!
//! The kernel addresses everything by 64-bit inode; the remote protocol
//! addresses everything by path. This table owns the mapping. Inode 1 is
//! the mount root and always resolves to `/`.

use std::collections::HashMap;

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
pub struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.by_ino.insert(ROOT_INO, "/".to_string());
        table.by_path.insert("/".to_string(), ROOT_INO);
        table
    }

    /// Inode for a path, minting one on first sight.
    pub fn assign(&mut self, path: &str) -> u64 {
        let path = normalize(path);
        if let Some(&ino) = self.by_path.get(&path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.clone());
        self.by_path.insert(path, ino);
        ino
    }

    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(String::as_str)
    }

    pub fn ino_of(&self, path: &str) -> Option<u64> {
        self.by_path.get(&normalize(path)).copied()
    }

    /// Drop the mapping for a path after unlink/rmdir.
    pub fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.by_path.remove(&normalize(path)) {
            self.by_ino.remove(&ino);
        }
    }

    /// Move an inode to a new path after rename. The inode survives so
    /// handles the kernel already holds stay valid.
    pub fn reassign(&mut self, old: &str, new: &str) {
        let old = normalize(old);
        let new = normalize(new);
        if let Some(ino) = self.by_path.remove(&old) {
            // a rename target that already had an inode is replaced
            if let Some(evicted) = self.by_path.remove(&new) {
                self.by_ino.remove(&evicted);
            }
            self.by_ino.insert(ino, new.clone());
            self.by_path.insert(new, ino);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Leading slash, no trailing slash, `/` for empty input.
fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Append a child name to a directory path.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Directory component of a path; the root is its own parent.
pub fn parent_of(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}
