use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;

use medialift::api::{AppState, create_router};
use medialift::blob::FsBlobReader;
use medialift::client::RateLimitedClient;
use medialift::config::{self, UploadConfig};
use medialift::coordinator::{Coordinator, StoreHistoryEmitter};
use medialift::events::EventBroadcaster;
use medialift::logging;
use medialift::store::SessionStore;

const BIND_ADDR: &str = "127.0.0.1:7878";

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive for the entire application lifetime.
    let _log_guard = logging::init_logging(&config::log_dir())
        .context("Failed to initialize logging system")?;

    tracing::info!(target: "main", "Starting medialift upload service...");

    let upload_config = UploadConfig::default();
    let base_url = config::api_base_url();
    tracing::info!(target: "main", %base_url, "Backend configured");

    let api = Arc::new(
        RateLimitedClient::new(&base_url, &upload_config)
            .context("Failed to create upload client")?,
    );
    let blobs = Arc::new(FsBlobReader::new());
    let store = Arc::new(SessionStore::new(config::state_dir(), &upload_config));
    let events = EventBroadcaster::new(256);
    let history = StoreHistoryEmitter::new(Arc::clone(&store), events.clone());

    let coordinator = Coordinator::new(
        api,
        blobs,
        Arc::clone(&store),
        events.clone(),
        history,
        upload_config,
    );

    // Load persisted state, then restore and resume interrupted sessions
    // before accepting any control traffic.
    coordinator.init().await;
    coordinator.on_foreground().await;
    tracing::info!(target: "main", "Upload coordinator ready");

    let state = AppState {
        coordinator: Arc::clone(&coordinator),
        events: events.clone(),
    };
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(BIND_ADDR)
        .await
        .context(format!("Failed to bind to {BIND_ADDR}"))?;
    tracing::info!(target: "main", "Control API listening on http://{BIND_ADDR}");
    tracing::info!(target: "main", "SSE events at http://{BIND_ADDR}/api/events");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&coordinator)))
        .await
        .context("Server error")?;

    tracing::info!(target: "main", "Shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal, then flush durable state.
async fn shutdown_signal(coordinator: Arc<Coordinator>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(target: "main", "Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!(target: "main", "Received SIGTERM signal");
        }
    }

    tracing::info!(target: "main", "Shutting down, persisting upload state...");
    coordinator.on_background().await;
}
