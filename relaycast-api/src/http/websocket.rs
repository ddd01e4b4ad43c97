//! Listener push transport
//!
//! `GET /ws` upgrades to a WebSocket and hands the socket to the fan-out
//! registry. Every broadcast payload goes out as one text frame; inbound
//! frames are read only to notice the client going away.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relaycast_cluster::PushConnection;
use relaycast_core::{Error, Result};

use crate::http::AppState;

/// Inbound frames are not part of the protocol, keep them small
const MAX_MESSAGE_SIZE: usize = 4 * 1024;

/// WebSocket upgrade handler
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE).on_upgrade(move |socket| async move {
        match state.fanout.attach(WsConnection::new(socket)).await {
            Ok(connection_id) => debug!(connection_id = %connection_id, "WebSocket listener registered"),
            Err(e) => warn!(error = %e, "WebSocket listener rejected"),
        }
    })
}

/// [`PushConnection`] over an upgraded WebSocket
pub struct WsConnection {
    sender: SplitSink<WebSocket, Message>,
    reader: JoinHandle<()>,
}

impl WsConnection {
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        let (sender, mut receiver) = socket.split();

        // Drain client frames so pings are answered and close frames seen
        let reader = tokio::spawn(async move {
            while let Some(frame) = receiver.next().await {
                match frame {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Self { sender, reader }
    }
}

#[async_trait::async_trait]
impl PushConnection for WsConnection {
    async fn send(&mut self, payload: &str) -> Result<()> {
        if self.reader.is_finished() {
            return Err(Error::Transport("WebSocket client disconnected".to_string()));
        }

        self.sender
            .send(Message::Text(payload.to_owned().into()))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket send failed: {e}")))
    }

    async fn close(&mut self) {
        if !self.reader.is_finished() {
            let _ = self.sender.send(Message::Close(None)).await;
        }
        let _ = self.sender.close().await;
        self.reader.abort();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
