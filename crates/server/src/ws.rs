//! Downstream WebSocket endpoint: every upgraded client becomes a hub subscriber.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use phantomias_shared::Notification;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::hub::{RelayHub, SinkError, Subscriber, SubscriberSink};
use crate::state::AppState;

/// Write half of an axum WebSocket, as the hub sees it.
pub struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl SubscriberSink for WsSink {
    async fn send(&mut self, notification: &Notification) -> Result<(), SinkError> {
        let msg = match notification.as_text() {
            Some(text) => Message::Text(text.into()),
            None => Message::Binary(notification.as_bytes().to_vec().into()),
        };
        self.sender
            .send(msg)
            .await
            .map_err(|e| SinkError::Write(Box::new(e)))
    }

    async fn close(&mut self) {
        let _ = self.sender.send(Message::Close(None)).await;
        let _ = self.sender.close().await;
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::debug!("WebSocket upgrade from {}", addr);
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state.hub, state.shutdown))
}

/// Registers the socket with the hub and reads until the client goes away.
/// Inbound frames carry nothing and are discarded.
async fn handle_socket(
    socket: WebSocket,
    addr: SocketAddr,
    hub: RelayHub,
    shutdown: CancellationToken,
) {
    let (sender, mut receiver) = socket.split();
    let id = Uuid::new_v4();

    if let Err(e) = hub
        .register(Subscriber::new(id, Some(addr), WsSink::new(sender)))
        .await
    {
        tracing::warn!("Dropping WebSocket from {}: {}", addr, e);
        return;
    }

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!("read error from {}: {}", addr, e);
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    let _ = hub.unregister(id).await;
    tracing::debug!("WebSocket connection closed for {}", addr);
}
