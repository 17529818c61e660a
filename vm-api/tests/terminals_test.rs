//! Integration tests for terminal sessions over REST and websocket frames

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{json, Value};
use vm_api::routes::ws::handle_frame;
use vm_terminal::{event_channel, ClientFrame, TerminalEvent};

const WAIT: Duration = Duration::from_secs(10);

async fn running_vm(client: &common::TestClient) -> i64 {
    client
        .state
        .controller
        .create(common::create_request("web", 7))
        .await
        .expect("Failed to create VM")
        .vm
        .id
}

/// Poll the output endpoint until `done` holds for the concatenated output.
async fn read_output(client: &common::TestClient, id: &str, done: impl Fn(&str, bool) -> bool) -> String {
    let mut output = String::new();
    tokio::time::timeout(WAIT, async {
        loop {
            let body: Value = common::extract_json_body(
                client
                    .get(&format!("/api/v1/terminals/{}/output", id))
                    .await,
            )
            .await;
            let mut disconnected = false;
            for event in body["events"].as_array().cloned().unwrap_or_default() {
                if event["type"] == "ssh_output" {
                    output.push_str(event["output"].as_str().unwrap_or_default());
                }
                disconnected |= event["type"] == "ssh_disconnected";
            }
            if done(&output, disconnected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for terminal output");
    output
}

#[tokio::test]
async fn test_rest_terminal_round_trip() {
    let client = common::TestClient::new().await;
    let vm_id = running_vm(&client).await;

    let response = client
        .post("/api/v1/terminals", &json!({ "vm_id": vm_id.to_string() }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = common::extract_json_body(response).await;
    let id = body["terminal_id"].as_str().unwrap().to_string();
    assert!(id.starts_with(&format!("{}_root_", vm_id)));

    let listed: Value = common::extract_json_body(client.get("/api/v1/terminals").await).await;
    assert_eq!(listed["terminals"][0]["terminal_id"], id.as_str());
    assert_eq!(listed["terminals"][0]["status"], "active");

    let response = client
        .post(
            &format!("/api/v1/terminals/{}/input", id),
            &json!({ "input": "hello\n" }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let output = read_output(&client, &id, |out, _| out.contains("hello")).await;
    assert!(output.contains("hello"));

    let response = client.delete(&format!("/api/v1/terminals/{}", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    read_output(&client, &id, |_, disconnected| disconnected).await;

    let response = client.get(&format!("/api/v1/terminals/{}", id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = client.get(&format!("/api/v1/terminals/{}/output", id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_terminal_to_stopped_vm_is_refused() {
    let client = common::TestClient::new().await;
    let vm_id = running_vm(&client).await;
    client.state.controller.stop(vm_id).await.unwrap();

    let response = client
        .post("/api/v1/terminals", &json!({ "vm_id": vm_id.to_string() }))
        .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = common::extract_json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("stopped"));
}

#[tokio::test]
async fn test_input_to_unknown_terminal_is_not_found() {
    let client = common::TestClient::new().await;

    let response = client
        .post("/api/v1/terminals/nope/input", &json!({ "input": "ls\n" }))
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ws_connect_to_unknown_vm_reports_error() {
    let client = common::TestClient::new().await;
    let (tx, mut rx) = event_channel();

    let frame = ClientFrame::Connect {
        vm_id: "404".to_string(),
        username: "root".to_string(),
    };
    handle_frame(&client.state, "browser-1", frame, &tx).await;

    match rx.recv().await {
        Some(TerminalEvent::Error { terminal_id, error }) => {
            assert_eq!(terminal_id, None);
            assert!(error.contains("VM not found"));
        }
        other => panic!("expected ssh_error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ws_clients_cannot_touch_each_others_terminals() {
    let client = common::TestClient::new().await;
    let vm_id = running_vm(&client).await;
    let (owner_tx, mut owner_rx) = event_channel();
    let (other_tx, mut other_rx) = event_channel();

    let connect = ClientFrame::Connect {
        vm_id: vm_id.to_string(),
        username: "root".to_string(),
    };
    handle_frame(&client.state, "owner", connect, &owner_tx).await;
    let terminal_id = match tokio::time::timeout(WAIT, owner_rx.recv()).await {
        Ok(Some(TerminalEvent::Connected { terminal_id })) => terminal_id,
        other => panic!("expected ssh_connected, got {:?}", other),
    };

    let intrusion = ClientFrame::Disconnect {
        terminal_id: terminal_id.clone(),
    };
    handle_frame(&client.state, "intruder", intrusion, &other_tx).await;
    assert!(matches!(
        other_rx.recv().await,
        Some(TerminalEvent::Error { .. })
    ));
    assert!(client.state.terminals.get(&terminal_id).await.is_ok());

    assert_eq!(client.state.terminals.disconnect_client("owner").await, 1);
    let closed = tokio::time::timeout(WAIT, async {
        while let Some(event) = owner_rx.recv().await {
            if event.is_disconnected() {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(closed, Ok(true));
}
