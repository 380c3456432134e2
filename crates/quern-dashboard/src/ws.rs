//! WebSocket snapshot stream and the broadcast loop behind it.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quern_core::{JobState, JobUpdate};

use crate::snapshot::Snapshot;
use crate::AppState;

/// Close code sent when the handshake token does not match.
const CLOSE_UNAUTHORIZED: u16 = 4001;

const BROADCAST_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub(crate) struct WsParams {
    token: Option<String>,
}

/// Inbound client frame. Anything that does not parse into this shape is
/// silently ignored.
#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(rename = "type")]
    kind: String,
    job_id: Option<String>,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let authorized = state.token_matches(params.token.as_deref());
    ws.on_upgrade(move |socket| async move {
        if !authorized {
            reject(socket).await;
            return;
        }
        handle_socket(socket, state).await;
    })
}

async fn reject(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_UNAUTHORIZED,
            reason: "invalid token".into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let client_id = Uuid::new_v4();

    // Late joiners see current state immediately; this push bypasses the
    // broadcast dedup on purpose.
    match Snapshot::build(state.store.as_ref()).await {
        Ok(snapshot) => {
            let _ = tx.send(Message::Text(snapshot.to_frame()));
        }
        Err(err) => warn!(error = %err, "initial snapshot failed"),
    }

    state.clients.insert(client_id, tx);
    debug!(client = %client_id, "dashboard client connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        if let Message::Text(text) = message {
            handle_client_message(&state, &text).await;
        }
    }

    state.clients.remove(&client_id);
    writer.abort();
    debug!(client = %client_id, "dashboard client disconnected");
}

/// Apply a client request. Only `{"type":"retry","job_id":...}` on a dead
/// job does anything; the handshake token already gated the connection, so
/// no per-message auth check happens here.
pub(crate) async fn handle_client_message(state: &AppState, text: &str) {
    let Ok(message) = serde_json::from_str::<InboundMessage>(text) else {
        return;
    };
    if message.kind != "retry" {
        return;
    }
    let Some(job_id) = message.job_id else {
        return;
    };
    match state.store.get_job(&job_id).await {
        Ok(job) if job.state == JobState::Dead => {
            match state
                .store
                .update_job_state(&job_id, &JobUpdate::requeue())
                .await
            {
                Ok(()) => {
                    info!(job_id = %job_id, "job requeued from dead letter queue");
                    state.refresh.notify_one();
                }
                Err(err) => warn!(job_id = %job_id, error = %err, "dashboard requeue failed"),
            }
        }
        // Unknown job or not dead: ignore, matching the wire contract.
        Ok(_) | Err(_) => {}
    }
}

/// Background task: build a snapshot every tick (or on demand), skip it when
/// nothing changed, otherwise serialise once and fan out. Clients whose
/// channel is gone are dropped from the registry.
pub(crate) async fn broadcast_loop(state: AppState) {
    let mut tick = tokio::time::interval(BROADCAST_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<Snapshot> = None;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = state.refresh.notified() => {}
        }

        let snapshot = match Snapshot::build(state.store.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "snapshot build failed");
                continue;
            }
        };
        if last.as_ref() == Some(&snapshot) {
            continue;
        }
        let frame = snapshot.to_frame();
        last = Some(snapshot);

        let mut dropped = Vec::new();
        for entry in state.clients.iter() {
            if entry.value().send(Message::Text(frame.clone())).is_err() {
                dropped.push(*entry.key());
            }
        }
        for client_id in dropped {
            state.clients.remove(&client_id);
            debug!(client = %client_id, "dropping dashboard client");
        }
    }
}
