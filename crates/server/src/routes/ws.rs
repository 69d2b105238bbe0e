//! WebSocket events: /ws/events
//!
//! A new client first receives `transfers.snapshot` with every running
//! transfer, then the live stream: `transfer.progress`, `transfer.finished`
//! (carrying the message key), `model.deleted` and `system.pruned`.

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::state::{AppState, event_message};

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/events", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the snapshot so nothing falls between the two.
    let mut events = state.subscribe_events();
    info!("event client connected");

    let running = serde_json::to_value(state.engine().sessions().snapshots()).unwrap_or_default();
    let hello = event_message("transfers.snapshot", running);
    if sender.send(Message::Text(hello.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event client lagging, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if sender.send(Message::Text(event.into())).await.is_err() {
                    break;
                }
            }
            // Pings are answered by the protocol layer; clients send nothing else.
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("event client disconnected");
}
