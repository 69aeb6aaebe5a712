//! Mount a remote content repository as a local filesystem.
//!
//! Kernel file operations become JSON/HTTP calls against a backend I/O
//! service. Content is cached on disk per node, validated with etags,
//! and written back in full when the last open handle closes.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fuse;

pub use config::MountConfig;
pub use error::FsError;
