//! Response classification for the remote I/O service.
//!
//! Failures carry a `{"errno": "<symbolic-name>"}` envelope on HTTP 400.
//! The names form a closed set; anything absent or unrecognized degrades
//! to a generic I/O error. Classification happens exactly once, here.

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::FsError;

/// Symbolic error names the service may place in a 400 envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RemoteErrno {
    #[serde(rename = "ENOTEMPTY")]
    NotEmpty,
    #[serde(rename = "ENOTDIR")]
    NotADirectory,
    #[serde(rename = "ENOENT")]
    NoEntry,
    #[serde(rename = "EIO")]
    Io,
    #[serde(rename = "ENOTSUP")]
    NotSupported,
    #[serde(rename = "ENOATTR")]
    NoAttribute,
    #[serde(rename = "EEXIST")]
    Exists,
    #[serde(rename = "EISDIR")]
    IsADirectory,
    #[serde(other)]
    Unknown,
}

impl From<RemoteErrno> for FsError {
    fn from(errno: RemoteErrno) -> Self {
        match errno {
            RemoteErrno::NotEmpty => FsError::DirectoryNotEmpty,
            RemoteErrno::NotADirectory => FsError::NotADirectory,
            RemoteErrno::NoEntry => FsError::NotFound,
            RemoteErrno::NotSupported => FsError::Unsupported,
            RemoteErrno::NoAttribute => FsError::AttributeNotFound,
            RemoteErrno::Exists => FsError::AlreadyExists,
            RemoteErrno::IsADirectory => FsError::IsADirectory,
            RemoteErrno::Io | RemoteErrno::Unknown => generic_io("remote error"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    errno: Option<RemoteErrno>,
}

/// Map a non-success response to the error domain.
///
/// 404 carries no envelope; only 400 is decoded. Every other status is a
/// plain I/O failure.
pub fn classify_response(status: StatusCode, body: &str) -> FsError {
    match status {
        StatusCode::NOT_FOUND => FsError::NotFound,
        StatusCode::BAD_REQUEST => match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(ErrorEnvelope { errno: Some(code) }) => code.into(),
            _ => generic_io("malformed error envelope"),
        },
        other => generic_io(&format!("unexpected http status {}", other)),
    }
}

fn generic_io(msg: &str) -> FsError {
    FsError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_without_envelope() {
        let err = classify_response(StatusCode::NOT_FOUND, "");
        assert!(matches!(err, FsError::NotFound));
    }

    #[test]
    fn bad_request_decodes_symbolic_errno() {
        let err = classify_response(StatusCode::BAD_REQUEST, r#"{"errno":"ENOTEMPTY"}"#);
        assert!(matches!(err, FsError::DirectoryNotEmpty));

        let err = classify_response(StatusCode::BAD_REQUEST, r#"{"errno":"EEXIST"}"#);
        assert!(matches!(err, FsError::AlreadyExists));

        let err = classify_response(StatusCode::BAD_REQUEST, r#"{"errno":"EISDIR"}"#);
        assert!(matches!(err, FsError::IsADirectory));
    }

    #[test]
    fn unknown_errno_degrades_to_io() {
        let err = classify_response(StatusCode::BAD_REQUEST, r#"{"errno":"EWHATEVER"}"#);
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn absent_errno_degrades_to_io() {
        let err = classify_response(StatusCode::BAD_REQUEST, "{}");
        assert_eq!(err.errno(), libc::EIO);

        let err = classify_response(StatusCode::BAD_REQUEST, "not json at all");
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn other_statuses_are_io() {
        let err = classify_response(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert_eq!(err.errno(), libc::EIO);

        let err = classify_response(StatusCode::FORBIDDEN, "");
        assert_eq!(err.errno(), libc::EIO);
    }
}
