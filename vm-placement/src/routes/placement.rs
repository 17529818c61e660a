use crate::{
    api_error::ApiResult,
    service::{PlacementOutcome, PlacementRequest},
    state::AppState,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/placement", post(find_suitable_host))
}

/// A request no host can satisfy answers 404 with
/// `{"outcome": "no_suitable_host"}`.
async fn find_suitable_host(
    State(state): State<AppState>,
    Json(req): Json<PlacementRequest>,
) -> ApiResult<Response> {
    let outcome = state.placement.place(&req).await?;

    let status = match outcome {
        PlacementOutcome::NoSuitableHost => StatusCode::NOT_FOUND,
        PlacementOutcome::Selected { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}
