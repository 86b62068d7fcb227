#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server and HTTP side-band

pub mod connection;
pub mod protocol;

use crate::config::ListenConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomSummary;
use crate::session::SessionOrchestrator;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub use connection::CHANNEL_CAPACITY;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    orchestrator: Arc<SessionOrchestrator>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    settings: Arc<ListenConfig>,
    shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionStatus {
    active: u64,
    total: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerStatus {
    engine_alive: bool,
    accepting_connections: bool,
    connections: ConnectionStatus,
    last_connection_unix: Option<u64>,
    rooms: usize,
    participants: usize,
}

impl SignalingServer {
    pub fn new(
        orchestrator: Arc<SessionOrchestrator>,
        metrics: ServerMetrics,
        settings: ListenConfig,
        shutdown: CancellationToken,
    ) -> Self {
        info!("Max connections: {}", settings.max_connections);
        Self {
            orchestrator,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(settings.max_connections)),
            settings: Arc::new(settings),
            shutdown,
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/rooms", get(rooms_handler))
            .route("/health", get(health_handler))
            .route("/status", get(status_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Serves until the shutdown token is cancelled
    ///
    /// # Errors
    /// Returns an error if the accept loop fails
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Signaling server listening on {}", listener.local_addr()?);
        let shutdown = self.shutdown.clone();
        let app = self.router();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        Ok(())
    }
}

/// Room discovery handler
async fn rooms_handler(State(server): State<SignalingServer>) -> Json<Vec<RoomSummary>> {
    Json(server.orchestrator.registry().list())
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let registry = server.orchestrator.registry();
    let status = if server.orchestrator.is_accepting() {
        "ok"
    } else {
        "degraded"
    };
    Json(serde_json::json!({
        "status": status,
        "rooms": registry.room_count(),
        "participants": registry.participant_count(),
    }))
}

async fn status_handler(State(server): State<SignalingServer>) -> Json<ServerStatus> {
    let registry = server.orchestrator.registry();
    let engine_alive = server.orchestrator.is_accepting();
    Json(ServerStatus {
        engine_alive,
        accepting_connections: engine_alive && server.connection_semaphore.available_permits() > 0,
        connections: ConnectionStatus {
            active: server.metrics.connections_active(),
            total: server.metrics.connections_total(),
        },
        last_connection_unix: server.metrics.last_connection_unix(),
        rooms: registry.room_count(),
        participants: registry.participant_count(),
    })
}

/// Metrics handler, Prometheus text exposition format
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let registry = server.orchestrator.registry();
    let body = server
        .metrics
        .render_prometheus(registry.room_count(), registry.participant_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    if !server.orchestrator.is_accepting() {
        warn!("Media engine unavailable, rejecting WebSocket upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "Media engine unavailable").into_response();
    }

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let idle_timeout = Duration::from_secs(server.settings.idle_timeout_secs);
    ws.max_message_size(server.settings.max_message_size)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.orchestrator,
                server.metrics,
                idle_timeout,
                server.shutdown,
                permit,
            )
        })
}
