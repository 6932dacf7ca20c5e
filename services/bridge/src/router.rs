//! HTTP routing.

use crate::{state::AppState, ws::ws_handler};
use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Creates the router. Both routes serve the health check on a plain GET and
/// upgrade to a session otherwise.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/llm-websocket/{call_id}", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
