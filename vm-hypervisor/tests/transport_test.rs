//! Tests for the unix-socket control transport against a canned HTTP server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use vm_hypervisor::{
    ControlMethod, ControlTransport, DriverError, HypervisorDriver, UnixSocketTransport,
};

/// Read one HTTP/1.1 request, body included.
async fn read_request(stream: &mut UnixStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }

    String::from_utf8_lossy(&buf).into_owned()
}

fn http_response(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
    )
}

/// Serve a single request with `response`, handing the raw request back.
fn serve_once(socket: &Path, response: String) -> oneshot::Receiver<String> {
    let listener = UnixListener::bind(socket).unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
        let _ = tx.send(request);
    });

    rx
}

fn socket_in(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("firecracker.socket")
}

#[tokio::test]
async fn test_success_reply_returns_status_and_body() {
    let dir = tempfile::tempdir().unwrap();
    let socket = socket_in(&dir);
    let body = r#"{"vcpu_count":2,"mem_size_mib":2048,"smt":false}"#;
    let request = serve_once(&socket, http_response("200 OK", body));

    let response = UnixSocketTransport::new()
        .request(&socket, ControlMethod::Get, "/machine-config", None)
        .await
        .expect("request should succeed");

    assert_eq!(response.status, 200);
    assert!(response.is_success());
    assert_eq!(response.body, body);

    let raw = request.await.unwrap();
    assert!(raw.starts_with("GET /machine-config HTTP/1.1"), "{}", raw);
}

#[tokio::test]
async fn test_error_reply_keeps_the_fault_message() {
    let dir = tempfile::tempdir().unwrap();
    let socket = socket_in(&dir);
    let fault = r#"{"fault_message":"The kernel file cannot be opened"}"#;
    let request = serve_once(&socket, http_response("400 Bad Request", fault));

    let response = UnixSocketTransport::new()
        .request(
            &socket,
            ControlMethod::Put,
            "/boot-source",
            Some(json!({ "kernel_image_path": "/missing/vmlinux" })),
        )
        .await
        .expect("a 4xx is still a response");

    assert_eq!(response.status, 400);
    assert!(!response.is_success());
    assert_eq!(response.body, fault);

    let raw = request.await.unwrap();
    assert!(raw.starts_with("PUT /boot-source HTTP/1.1"), "{}", raw);
    assert!(raw.contains("/missing/vmlinux"));
}

#[tokio::test]
async fn test_driver_turns_rejection_into_error() {
    let dir = tempfile::tempdir().unwrap();
    let socket = socket_in(&dir);
    let fault = r#"{"fault_message":"Invalid vCPU count"}"#;
    let _request = serve_once(&socket, http_response("400 Bad Request", fault));

    let driver = HypervisorDriver::new(Arc::new(UnixSocketTransport::new()), &socket);
    let err = driver.set_machine_config(0, 128, false).await.unwrap_err();

    match err {
        DriverError::Rejected { status, body, .. } => {
            assert_eq!(status, 400);
            assert_eq!(body, fault);
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_silent_hypervisor_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let socket = socket_in(&dir);
    let listener = UnixListener::bind(&socket).unwrap();

    // accept and read, never answer
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let transport = UnixSocketTransport::new().with_timeout(Duration::from_millis(200));
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        transport.request(&socket, ControlMethod::Get, "/machine-config", None),
    )
    .await
    .expect("transport must give up on its own");

    match result {
        Err(DriverError::Transport { message, .. }) => {
            assert!(message.contains("within 200ms"), "{}", message);
        }
        other => panic!("expected a transport error, got {:?}", other),
    }

    server.abort();
}

#[tokio::test]
async fn test_missing_socket_is_a_transport_error() {
    let dir = tempfile::tempdir().unwrap();

    let result = UnixSocketTransport::new()
        .request(&socket_in(&dir), ControlMethod::Get, "/", None)
        .await;

    assert!(matches!(result, Err(DriverError::Transport { .. })));
}
