// Module: http
// HTTP surface: WebSocket signaling endpoint, health check, static demo client

pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use huddle_sfu::{Config, RoomManager};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RoomManager>,
    pub config: Arc<Config>,
}

/// Create the HTTP router with all routes
pub fn create_router(manager: Arc<RoomManager>, config: Arc<Config>) -> Router {
    let static_dir = config.server.static_dir.clone();
    let state = AppState { manager, config };

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Signaling
        .route("/ws", get(websocket::websocket_handler))
        // Demo client; not part of the SFU itself
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
