// Public API for integration tests and potential library usage

pub mod api;
pub mod config;
pub mod dispatch;
pub mod fetch;
pub mod hub;
pub mod protocol;
pub mod ssrf;
pub mod state;
pub mod types;
pub mod ws;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use state::AppState;

/// CORS for the dashboard-facing endpoints. `None` allows any origin.
pub fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
    let origin = match allowed_origin.map(HeaderValue::from_str) {
        Some(Ok(value)) => AllowOrigin::exact(value),
        Some(Err(e)) => {
            tracing::warn!("Invalid ALLOWED_ORIGIN ({}), allowing any origin", e);
            AllowOrigin::any()
        }
        None => AllowOrigin::any(),
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// All routes, without CORS or tracing layers
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/proxy", get(api::proxy))
        .route("/tasks", post(api::enqueue_task))
        .with_state(state)
}
