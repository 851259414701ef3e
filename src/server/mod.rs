//! WebSocket server surface.
//!
//! Two routes: `/ws/process` for uploaded or remote videos and
//! `/ws/camera` for the live device. Each accepted socket becomes one
//! session task with its own engine and pipeline.

mod protocol;
mod session;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::{error, info};

pub use protocol::{ClientMessage, StatusEvent};

use crate::collab::{CompletedVideoSink, FireNotifier, ObjectStore, VideoFetcher};
use crate::engine::EngineFactory;
use crate::error::PipelineError;
use crate::Config;

/// Shared dependencies handed to every session.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine_factory: EngineFactory,
    pub store: Arc<dyn ObjectStore>,
    pub fetcher: Arc<dyn VideoFetcher>,
    pub notifier: Arc<dyn FireNotifier>,
    pub registry: Arc<dyn CompletedVideoSink>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/process", get(process_handler))
        .route("/ws/camera", get(camera_handler))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), PipelineError> {
    let addr = state.config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PipelineError::SourceUnavailable(format!("bind {addr}: {e}")))?;
    info!(%addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("server error: {e}");
            PipelineError::TransportDisconnect
        })
}

async fn process_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::run_file_session(socket, state))
}

async fn camera_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::run_camera_session(socket, state))
}
