//! Dashboard surface for the quern job queue.
//!
//! A thin axum application over an `Arc<dyn Store>`: read-only JSON
//! endpoints, one token-gated mutation (`POST /api/dlq/retry`), and a
//! WebSocket snapshot stream fed by a once-per-second broadcast task that
//! skips unchanged cycles.
//!
//! Authentication is a single optional shared secret: when set, WebSocket
//! handshakes must carry it as a `token` query parameter and mutations as an
//! `x-api-key` header. Read endpoints stay open either way.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::Message;
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use quern_core::Store;

mod api;
mod snapshot;
mod ws;

pub use snapshot::Snapshot;

type ClientMap = DashMap<Uuid, mpsc::UnboundedSender<Message>>;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    token: Option<String>,
    clients: Arc<ClientMap>,
    /// Poked after a mutation to trigger an immediate broadcast cycle.
    refresh: Arc<Notify>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, token: Option<String>) -> Self {
        Self {
            store,
            token,
            clients: Arc::new(DashMap::new()),
            refresh: Arc::new(Notify::new()),
        }
    }

    /// Opaque equality check against the shared secret; no secret configured
    /// means everything is allowed.
    fn token_matches(&self, provided: Option<&str>) -> bool {
        match &self.token {
            None => true,
            Some(expected) => provided == Some(expected.as_str()),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", get(api::list_jobs))
        .route("/api/status", get(api::status))
        .route("/api/jobs/:id/events", get(api::job_events))
        .route("/api/dlq/retry", post(api::dlq_retry))
        .route("/api/health", get(api::health))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the dashboard until SIGINT/SIGTERM. The broadcast task runs for the
/// lifetime of the process.
pub async fn serve(
    store: Arc<dyn Store>,
    addr: SocketAddr,
    token: Option<String>,
) -> anyhow::Result<()> {
    let state = AppState::new(store, token);
    tokio::spawn(ws::broadcast_loop(state.clone()));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, auth = state.token.is_some(), "dashboard listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(quern_core::wait_for_signal())
        .await?;
    Ok(())
}
