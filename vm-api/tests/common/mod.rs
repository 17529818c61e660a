//! Common test utilities and helpers for vm-api tests
//!
//! Builds the full router over an in-memory database, the mock provisioner
//! and control transport, and a local program in place of ssh.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use tempfile::TempDir;
use tower::ServiceExt;
use vm_api::{create_app, AppState};
use vm_hypervisor::mock::MockTransport;
use vm_orchestrator::mock::MockProvisioner;
use vm_orchestrator::test_utils::create_test_db;
use vm_orchestrator::{
    ControllerTiming, CreateVmRequest, MachineStore, VmLayout, VmLifecycleController,
};
use vm_terminal::mock::LocalLauncher;

pub struct TestClient {
    pub app: Router,
    pub state: AppState,
    pub provisioner: Arc<MockProvisioner>,
    pub transport: Arc<MockTransport>,
    pub dir: TempDir,
}

impl TestClient {
    /// Terminals run `cat`, which echoes whatever is typed.
    pub async fn new() -> Self {
        Self::with_launcher(LocalLauncher::new("cat", &[])).await
    }

    pub async fn with_launcher(launcher: LocalLauncher) -> Self {
        let pool = create_test_db().await;
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let layout = VmLayout {
            root_dir: dir.path().join("vm"),
            socket_dir: dir.path().join("sockets"),
            log_dir: dir.path().join("logs"),
            kernel_image_name: "vmlinux-5.10.225".to_string(),
        };

        let provisioner = Arc::new(MockProvisioner::new());
        let transport = Arc::new(MockTransport::new());
        let controller = VmLifecycleController::new(
            MachineStore::new(pool),
            provisioner.clone(),
            transport.clone(),
            layout,
        )
        .with_timing(ControllerTiming {
            stop_grace: Duration::ZERO,
            socket_timeout: Duration::from_secs(2),
        });

        let state = AppState::new(controller, Arc::new(launcher));
        Self {
            app: create_app(state.clone()),
            state,
            provisioner,
            transport,
            dir,
        }
    }

    /// Send a request to the API
    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn post<T: serde::Serialize>(&self, uri: &str, body: &T) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(body).unwrap()))
            .unwrap();
        self.send_request(request).await
    }

    /// POST without a body
    pub async fn post_empty(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn delete(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }
}

pub fn create_request(name: &str, user_id: i64) -> CreateVmRequest {
    CreateVmRequest {
        name: name.to_string(),
        user_id,
        os_type: "ubuntu".to_string(),
        cpu_count: 2,
        memory_size_mib: 2048,
        disk_size_gb: 5,
        service_cluster_id: Some(1),
        vm_offer_id: Some(1),
        system_image_id: Some(2),
        root_password: None,
    }
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}
