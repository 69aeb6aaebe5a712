//! Protocol client against a canned-response HTTP server.
//!
//! A plain TcpListener on a loopback port answers each connection with a
//! prepared response and records what it received, enough to check URL
//! shape, auth, and error classification without a real backend.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use repofs::api::{ClientPool, IoClient};
use repofs::{FsError, MountConfig};

struct Exchange {
    request: String,
}

/// Serve `responses` one per connection, reporting each raw request.
fn serve(responses: Vec<String>) -> (u16, mpsc::Receiver<Exchange>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let port = listener.local_addr().expect("local addr").port();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for response in responses {
            let (mut stream, _) = match listener.accept() {
                Ok(c) => c,
                Err(_) => return,
            };
            let mut buf = [0u8; 8192];
            let mut request = Vec::new();
            // read until the blank line ending the header block; the
            // test requests carry no body worth waiting for beyond it
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = stream.write_all(response.as_bytes());
            let _ = tx.send(Exchange {
                request: String::from_utf8_lossy(&request).into_owned(),
            });
        }
    });

    (port, rx)
}

fn http_response(status: &str, headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
        status,
        body.len(),
        headers,
        body
    )
}

fn json_response(status: &str, body: &str) -> String {
    http_response(status, "Content-Type: application/json\r\n", body)
}

fn client_for(port: u16) -> IoClient {
    let config = MountConfig {
        userid: "admin".into(),
        password: "secret".into(),
        protocol: "http".into(),
        host: "127.0.0.1".into(),
        port,
        io_base: "/io".into(),
        mount_base: "workspace://root".into(),
        cache_dir: Some(PathBuf::from("/tmp")),
        timeout_secs: 5,
        pool_max: 2,
        housekeeping_secs: 60,
        cache_retention_secs: 3600,
        debug: false,
    };
    let pool = Arc::new(ClientPool::new(config.pool_max, Duration::from_secs(5)));
    IoClient::new(&config, pool)
}

#[test]
fn stat_builds_url_and_parses_fields() {
    let body = r#"{"st_mode":33188,"st_nlink":1,"st_blksize":4096,
                   "st_blocks":2,"st_size":612,"st_mtime_epoch_sec":1700000000}"#;
    let (port, rx) = serve(vec![json_response("200 OK", body)]);

    let stat = client_for(port).stat("/docs/a.txt").expect("stat");
    assert_eq!(stat.st_size, 612);
    assert_eq!(stat.st_mtime_epoch_sec, Some(1_700_000_000));

    let req = rx.recv_timeout(Duration::from_secs(5)).expect("request").request;
    let first_line = req.lines().next().expect("request line");
    assert!(first_line.starts_with("GET /io/stat?"), "got {first_line}");
    assert!(first_line.contains("base=workspace%3A%2F%2Froot"));
    assert!(first_line.contains("path=%2Fdocs%2Fa.txt"));
    assert!(req.contains("authorization: Basic") || req.contains("Authorization: Basic"));
}

#[test]
fn open_posts_json_body_and_returns_uuid() {
    let (port, rx) = serve(vec![json_response("200 OK", r#"{"uuid":"abc-123"}"#)]);

    let uuid = client_for(port).open("/docs/a.txt", libc::O_RDWR).expect("open");
    assert_eq!(uuid, "abc-123");

    let req = rx.recv_timeout(Duration::from_secs(5)).expect("request").request;
    assert!(req.starts_with("POST /io/open"));
    assert!(req.contains("content-type: application/json") || req.contains("Content-Type: application/json"));
}

#[test]
fn missing_node_maps_to_not_found() {
    let (port, _rx) = serve(vec![json_response("404 Not Found", "")]);

    let err = client_for(port).stat("/gone").expect_err("should fail");
    assert!(matches!(err, FsError::NotFound), "got {err:?}");
}

#[test]
fn error_envelope_maps_symbolic_errno() {
    let (port, _rx) = serve(vec![json_response(
        "400 Bad Request",
        r#"{"errno":"ENOTEMPTY"}"#,
    )]);

    let err = client_for(port).rmdir("/full").expect_err("should fail");
    assert!(matches!(err, FsError::DirectoryNotEmpty), "got {err:?}");
}

#[test]
fn unknown_envelope_falls_back_to_io_error() {
    let (port, _rx) = serve(vec![json_response(
        "400 Bad Request",
        r#"{"errno":"EWHATEVER"}"#,
    )]);

    let err = client_for(port).unlink("/x").expect_err("should fail");
    assert_eq!(err.errno(), libc::EIO);
}

#[test]
fn server_error_falls_back_to_io_error() {
    let (port, _rx) = serve(vec![json_response("500 Internal Server Error", "boom")]);

    let err = client_for(port).stat("/x").expect_err("should fail");
    assert_eq!(err.errno(), libc::EIO);
}

#[test]
fn conditional_read_sends_validator_and_sees_not_modified() {
    use repofs::api::ReadOutcome;

    let (port, rx) = serve(vec![http_response("304 Not Modified", "", "")]);

    let outcome = client_for(port)
        .read_content("/docs/a.txt", Some("v1"))
        .expect("read");
    assert!(matches!(outcome, ReadOutcome::NotModified));

    let req = rx.recv_timeout(Duration::from_secs(5)).expect("request").request;
    assert!(
        req.contains("if-none-match: \"v1\"") || req.contains("If-None-Match: \"v1\""),
        "got {req}"
    );
}

#[test]
fn fresh_read_streams_body_and_unquotes_etag() {
    use repofs::api::ReadOutcome;

    let (port, _rx) = serve(vec![http_response(
        "200 OK",
        "Etag: \"v2\"\r\n",
        "file contents",
    )]);

    let outcome = client_for(port)
        .read_content("/docs/a.txt", None)
        .expect("read");
    match outcome {
        ReadOutcome::Fetched { mut body, etag } => {
            assert_eq!(etag.as_deref(), Some("v2"));
            let mut bytes = Vec::new();
            body.read_to_end(&mut bytes).expect("body");
            assert_eq!(bytes, b"file contents");
        }
        ReadOutcome::NotModified => panic!("expected fresh content"),
    }
}

#[test]
fn xattr_list_requests_only_keys() {
    let (port, rx) = serve(vec![json_response("200 OK", r#"["repo.owner","repo.tag"]"#)]);

    let keys = client_for(port).xattr_list("/docs/a.txt").expect("list");
    assert_eq!(keys, vec!["repo.owner", "repo.tag"]);

    let req = rx.recv_timeout(Duration::from_secs(5)).expect("request").request;
    assert!(req.contains("mode=onlykeys"), "got {req}");
}

#[test]
fn statfs_parses_string_counts() {
    let (port, _rx) = serve(vec![json_response(
        "200 OK",
        r#"{"freeBytes":"1048576","totalBytes":"4194304","maxFilename":255}"#,
    )]);

    let usage = client_for(port).statfs().expect("statfs");
    assert_eq!(usage.free_bytes, "1048576");
    assert_eq!(usage.max_filename, 255);
}
