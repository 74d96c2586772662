//! Event fan-out WebSocket route: `/api/ws/monitor`.
//!
//! One forwarding loop per connection: messages arrive on the per-client
//! `mpsc::Receiver` handed back by `EventHub::subscribe_client` and are
//! written out as JSON text frames until the client disconnects or its
//! queue is dropped for being too slow.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tracing::debug;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/monitor", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut rx) = state.events.subscribe_client();
    debug!(client_id, "websocket monitor client connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
    debug!(client_id, "websocket monitor client disconnected");
}
