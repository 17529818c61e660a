use crate::{api_error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use crate::host::{ClusterHost, HostRegistration};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/hosts", get(list_hosts).post(register_host))
        .route("/api/v1/hosts/{id}", get(get_host))
}

async fn register_host(
    State(state): State<AppState>,
    Json(reg): Json<HostRegistration>,
) -> ApiResult<Json<ClusterHost>> {
    let host = state.placement.inventory().register(&reg).await?;
    Ok(Json(host))
}

async fn list_hosts(State(state): State<AppState>) -> ApiResult<Json<Vec<ClusterHost>>> {
    let hosts = state.placement.inventory().list().await?;
    Ok(Json(hosts))
}

async fn get_host(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ClusterHost>> {
    let host = state.placement.inventory().get(id).await?;
    Ok(Json(host))
}
