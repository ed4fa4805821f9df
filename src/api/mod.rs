//! Local HTTP control surface.
//!
//! Thin handlers over the coordinator's controller API plus an SSE stream of
//! upload events. Hosts (desktop shells, dev tools) drive uploads through
//! these routes; browsers are allowed in via a permissive CORS layer since
//! the listener is loopback-only.

mod error;
mod handlers;
mod sse;

pub use error::AppError;

use axum::{
    Json,
    Router,
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::Coordinator;
use crate::events::EventBroadcaster;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub events: EventBroadcaster,
}

/// Success envelope for control responses. Failures never pass through
/// here; they render via [`AppError`] with a machine-readable code.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Assemble the control router: upload queue controls, lifecycle hooks,
/// the SSE event stream, and a liveness probe.
pub fn create_router(state: AppState) -> Router {
    let uploads = Router::new()
        .route("/", post(handlers::enqueue).get(handlers::get_state))
        .route("/history", get(handlers::get_history))
        .route("/completed/clear", post(handlers::clear_completed))
        .route("/:id/status", get(handlers::remote_status))
        .route("/:id/pause", post(handlers::pause_upload))
        .route("/:id/resume", post(handlers::resume_upload))
        .route("/:id/cancel", post(handlers::cancel_upload))
        .route("/:id/retry", post(handlers::retry_upload));

    let lifecycle = Router::new()
        .route("/foreground", post(handlers::foreground))
        .route("/background", post(handlers::background));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/uploads", uploads)
        .nest("/api/lifecycle", lifecycle)
        .route("/api/events", get(sse::sse_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
