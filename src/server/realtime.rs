//! `/realtime` WebSocket: forwards the caller's topic as JSON text frames.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::session::Session;
use super::AppState;
use crate::realtime::RealtimeEvent;

pub async fn realtime_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    session: Session,
) -> Response {
    // Subscribe before the upgrade so nothing published in between is lost.
    let rx = state.hub.subscribe(&session.user_id).await;
    let listeners = state.hub.listener_count(&session.user_id).await;
    debug!(user_id = %session.user_id, listeners, "realtime subscription opened");
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        forward(socket, rx, &session.user_id).await;
        hub.prune().await;
    })
}

async fn forward(socket: WebSocket, mut rx: broadcast::Receiver<RealtimeEvent>, user_id: &str) {
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "realtime client lagging; events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(?err, "failed to encode realtime event");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // The channel is one-way; inbound frames only matter for detecting close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    // Await the aborted side so the topic receiver is dropped before pruning.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = send_task.await;
        }
    }
    debug!(%user_id, "realtime client disconnected");
}
