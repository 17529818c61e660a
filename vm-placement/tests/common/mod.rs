//! Shared helpers for vm-placement integration tests

#![allow(dead_code)]

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use tower::ServiceExt;
use vm_placement::{create_app, AppState, HostRegistration};

pub use vm_placement::test_utils::create_test_db;

/// App whose host agents are expected on `agent_port`.
pub async fn create_test_app(agent_port: u16) -> Router {
    let pool = create_test_db().await;
    let state = AppState::new(pool, agent_port, Duration::from_secs(5))
        .expect("Failed to build app state");
    create_app(state)
}

pub fn registration(mac: &str, ip: &str) -> HostRegistration {
    HostRegistration {
        name: format!("node-{}", &mac[mac.len() - 2..]),
        mac_address: mac.to_string(),
        ip: ip.to_string(),
        processor: "x86_64".to_string(),
        disk_total_gb: 245,
        disk_available_gb: 41,
        memory_total_gb: 15,
        memory_available_gb: 2,
        cpu_available_pct: 95.6,
        core_count: 4,
    }
}

pub async fn post_json<T: serde::Serialize>(app: &Router, uri: &str, body: &T) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
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

/// Serve `router` on an ephemeral local port and return the port.
pub async fn spawn_stub_agent(router: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stub agent");
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}
