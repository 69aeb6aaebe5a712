//! Error domain shared by every component.
//!
//! Remote failures are classified once at the protocol client boundary
//! and travel unchanged to the dispatcher, which converts them into the
//! errno the kernel reply expects.

use std::io;

/// Normalized error domain for filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("already exists")]
    AlreadyExists,
    #[error("is a directory")]
    IsADirectory,
    #[error("operation not supported")]
    Unsupported,
    #[error("attribute not found")]
    AttributeNotFound,
    /// Internal consistency violation. Reported, never acted on.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl FsError {
    /// Errno for the kernel reply.
    ///
    /// Local I/O errors keep their underlying OS error when one exists;
    /// everything unclassifiable degrades to `EIO`.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::DirectoryNotEmpty => libc::ENOTEMPTY,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::IsADirectory => libc::EISDIR,
            FsError::Unsupported => libc::ENOTSUP,
            FsError::AttributeNotFound => libc::ENODATA,
            FsError::InvalidState(_) => libc::EIO,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Http(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::DirectoryNotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::AttributeNotFound.errno(), libc::ENODATA);
        assert_eq!(FsError::InvalidState("x".into()).errno(), libc::EIO);
    }

    #[test]
    fn io_error_keeps_os_errno() {
        let err = FsError::Io(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn io_error_without_os_errno_is_eio() {
        let err = FsError::Io(io::Error::new(io::ErrorKind::Other, "synthetic"));
        assert_eq!(err.errno(), libc::EIO);
    }
}
