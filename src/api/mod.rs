//! HTTP surface of the sync service.
//!
//! Everything is mounted under /v1/:
//! - /v1/status, /v1/platforms
//! - /v1/connections: OAuth connect flow and connection management
//! - /v1/connections/{id}/assets, /sync, /cache: asset discovery
//! - /v1/quota

pub mod routes;

use crate::SharedState;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/v1", routes::v1_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
