pub mod health;
pub mod replicas;
pub mod terminals;
pub mod vms;
pub mod ws;

use crate::state::AppState;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_app(state: AppState) -> Router {
    // Allow CORS for the web console served from another origin
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(health::routes())
        .merge(vms::routes())
        .merge(terminals::routes())
        .merge(replicas::routes())
        .merge(ws::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
