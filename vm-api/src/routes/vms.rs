use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use vm_orchestrator::{
    CreateVmRequest, CreatedVm, StartedVm, VirtualMachine, VmMetrics,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/vms", get(list_vms).post(create_vm))
        .route("/api/v1/vms/{id}", get(get_vm).delete(delete_vm))
        .route("/api/v1/vms/{id}/start", post(start_vm))
        .route("/api/v1/vms/{id}/stop", post(stop_vm))
        .route("/api/v1/vms/{id}/status", get(vm_status))
        // {id} is the owner here; sibling routes must share the parameter name
        .route("/api/v1/vms/{id}/{name}/metrics", get(vm_metrics))
        .route("/api/v1/users/{user_id}/vms", get(list_user_vms))
}

async fn create_vm(
    State(state): State<AppState>,
    Json(req): Json<CreateVmRequest>,
) -> ApiResult<Json<CreatedVm>> {
    let created = state.controller.create(req).await?;
    Ok(Json(created))
}

async fn list_vms(State(state): State<AppState>) -> ApiResult<Json<Vec<VirtualMachine>>> {
    let vms = state.controller.list().await?;
    Ok(Json(vms))
}

async fn list_user_vms(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<Vec<VirtualMachine>>> {
    let vms = state.controller.list_by_user(user_id).await?;
    Ok(Json(vms))
}

async fn get_vm(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<VirtualMachine>> {
    let vm = state.controller.get(id).await?;
    Ok(Json(vm))
}

async fn delete_vm(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    state.controller.delete(id).await?;
    Ok(Json(json!({ "message": "VM deleted", "vm_id": id })))
}

async fn start_vm(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<StartedVm>> {
    let started = state.controller.start(id).await?;
    Ok(Json(started))
}

async fn stop_vm(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<VirtualMachine>> {
    let vm = state.controller.stop(id).await?;
    Ok(Json(vm))
}

/// The live status is the body in every case; a VM that cannot be found
/// on the host answers 404.
async fn vm_status(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Response> {
    let status = state.controller.status(id).await?;
    let code = if status.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    Ok((code, Json(status)).into_response())
}

async fn vm_metrics(
    State(state): State<AppState>,
    Path((user_id, name)): Path<(i64, String)>,
) -> ApiResult<Json<VmMetrics>> {
    let metrics = state.controller.metrics(user_id, &name).await?;
    Ok(Json(metrics))
}
