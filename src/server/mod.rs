pub mod health;
pub mod routes;
pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::daemon::events::JobEvent;
use crate::daemon::orchestrator::Orchestrator;
use crate::models::DaemonConfig;

/// Shared application state for the Axum server.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub event_tx: broadcast::Sender<JobEvent>,
    pub config: Arc<DaemonConfig>,
    pub start_time: Instant,
    pub shutdown_tx: Option<tokio::sync::watch::Sender<()>>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/resourceDownloader",
            get(routes::list_resources).post(routes::create_resource),
        )
        .route(
            "/resourceDownloader/{id}",
            get(routes::get_resource).delete(routes::delete_resource),
        )
        .route("/api/events", get(sse::sse_handler))
        .route("/api/shutdown", post(routes::shutdown))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
