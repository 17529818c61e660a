use crate::{error::ApiResult, state::AppState};
use axum::{extract::State, routing::get, Json, Router};
use vm_replication::{ImageRecord, OfferRecord};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/offers", get(list_offers))
        .route("/api/v1/images", get(list_images))
}

async fn list_offers(State(state): State<AppState>) -> ApiResult<Json<Vec<OfferRecord>>> {
    Ok(Json(state.replicas.list_offers().await?))
}

async fn list_images(State(state): State<AppState>) -> ApiResult<Json<Vec<ImageRecord>>> {
    Ok(Json(state.replicas.list_images().await?))
}
