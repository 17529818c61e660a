//! REST access to terminal sessions. Output of sessions opened here is
//! buffered until fetched from `/output`.

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use vm_terminal::TerminalInfo;

const REST_CLIENT_ID: &str = "rest";

fn default_username() -> String {
    "root".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub vm_id: String,
    #[serde(default = "default_username")]
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub input: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/terminals", get(list_terminals).post(connect_terminal))
        .route(
            "/api/v1/terminals/{id}",
            get(get_terminal).delete(disconnect_terminal),
        )
        .route("/api/v1/terminals/{id}/input", post(send_input))
        .route("/api/v1/terminals/{id}/output", get(drain_output))
}

async fn connect_terminal(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<Json<Value>> {
    let terminal_id = state
        .terminals
        .connect(
            REST_CLIENT_ID,
            &req.vm_id,
            &req.username,
            state.terminal_output.sender(),
        )
        .await?;

    Ok(Json(json!({
        "terminal_id": terminal_id,
        "status": "connected"
    })))
}

async fn list_terminals(State(state): State<AppState>) -> Json<Value> {
    let terminals: Vec<Value> = state
        .terminals
        .list()
        .await
        .into_iter()
        .map(|info| with_status(&info))
        .collect();
    Json(json!({ "terminals": terminals }))
}

async fn get_terminal(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let info = state.terminals.get(&id).await?;
    Ok(Json(with_status(&info)))
}

async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> ApiResult<Json<Value>> {
    state.terminals.write(&id, req.input.as_bytes()).await?;
    Ok(Json(json!({ "terminal_id": id, "status": "sent" })))
}

async fn drain_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let live = state.terminals.get(&id).await.is_ok();
    if !live && !state.terminal_output.contains(&id).await {
        return Err(ApiError::NotFound(format!("Terminal not found: {}", id)));
    }

    let events = state.terminal_output.drain(&id).await;
    Ok(Json(json!({
        "terminal_id": id,
        "active": live,
        "events": events
    })))
}

async fn disconnect_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.terminals.disconnect(&id).await?;
    Ok(Json(json!({ "terminal_id": id, "status": "disconnected" })))
}

fn with_status(info: &TerminalInfo) -> Value {
    json!({
        "terminal_id": info.terminal_id,
        "vm_id": info.vm_id,
        "username": info.username,
        "created_at": info.created_at,
        "status": "active"
    })
}
