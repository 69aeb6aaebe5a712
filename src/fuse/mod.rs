//! Kernel filesystem bridge.
//!
//! - `RepoFs`: the fuser callback surface
//! - `RefTable`: path-keyed registry of open files with writeback on close
//! - `InodeTable`: bidirectional inode ↔ path mapping

mod fs;
mod inode_table;
mod ref_table;

pub use fs::{RepoFs, XATTR_PREFIX};
pub use inode_table::{InodeTable, ROOT_INO};
pub use ref_table::{ContentBackend, FileRef, RefTable, RemoteBackend};
