//! Relays the upstream notification feed into the hub.
//!
//! One [`UpstreamRelay`] owns the reconnecting connection to the pool
//! backend. Every text frame it reads is handed to the hub's broadcast
//! channel in arrival order; anything else is dropped with a warning.

use parking_lot::Mutex;
use phantomias_shared::{ConnectionState, Notification};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::UpstreamConfig;
use crate::ws::connection::WsConnection;
use crate::ws::error::WsError;

/// Why [`UpstreamRelay::listen`] stopped relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The caller's cancellation token fired.
    Cancelled,
    /// The upstream closed the feed for good.
    UpstreamClosed,
    /// Nobody is receiving notifications any more.
    HubClosed,
}

pub struct UpstreamRelay {
    config: UpstreamConfig,
    broadcast: mpsc::Sender<Notification>,
    connection: Mutex<Option<WsConnection>>,
    status: Arc<StatusFeed>,
}

/// Upstream state as seen by readers of [`UpstreamRelay::status`].
///
/// Each installed connection gets a new generation; a watcher only forwards
/// while its generation is current, so a replaced connection cannot overwrite
/// the state of its successor.
struct StatusFeed {
    generation: Mutex<u64>,
    tx: watch::Sender<ConnectionState>,
}

impl StatusFeed {
    /// Starts a new generation at `state`.
    fn reset(&self, state: ConnectionState) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.tx.send_replace(state);
        *generation
    }

    /// Publishes `state` if `generation` is still current.
    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.tx.send_replace(state);
        true
    }
}

impl UpstreamRelay {
    pub fn new(config: UpstreamConfig, broadcast: mpsc::Sender<Notification>) -> Self {
        let (status, _) = watch::channel(ConnectionState::Closed);
        Self {
            config,
            broadcast,
            connection: Mutex::new(None),
            status: Arc::new(StatusFeed {
                generation: Mutex::new(0),
                tx: status,
            }),
        }
    }

    /// Upstream connection state, following whichever connection is current.
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status.tx.subscribe()
    }

    /// Keeps the relay running until `cancel` fires or the upstream closes
    /// the feed. A relay that cannot start is retried after the configured delay.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.listen(&cancel).await {
                Ok(RelayExit::Cancelled) => {
                    tracing::info!("upstream relay stopped");
                    return;
                }
                Ok(exit) => {
                    tracing::info!("upstream relay finished: {:?}", exit);
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        "failed to start websocket relay, retrying in {} seconds: {}",
                        self.config.retry_delay.as_secs(),
                        e
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("upstream relay stopped");
                    return;
                }
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }
    }

    /// Connects to the upstream and relays until cancelled or the feed ends.
    ///
    /// Fails only if the first dial fails. Once connected, transport errors
    /// are handled by reconnecting in the background.
    pub async fn listen(&self, cancel: &CancellationToken) -> Result<RelayExit, WsError> {
        let conn = WsConnection::new(&self.config.url, self.config.connection_options()?)?;
        self.install(&conn);

        match conn.dial_with_cancel(cancel).await {
            Ok(()) => {}
            Err(WsError::Cancelled) => {
                conn.close(true);
                return Ok(RelayExit::Cancelled);
            }
            Err(e) => {
                // A retry is pending; this connection is not the final word.
                self.status.reset(ConnectionState::Closed);
                conn.close(true);
                return Err(e);
            }
        }
        tracing::info!("relaying notifications from {}", conn.url());

        let exit = self.relay_messages(&conn, cancel).await;
        match exit {
            RelayExit::UpstreamClosed => conn.close(true),
            _ => conn.shutdown(self.config.shutdown_wait).await,
        }
        Ok(exit)
    }

    /// Closes the current upstream connection forever.
    pub fn close(&self) {
        if let Some(conn) = self.connection.lock().take() {
            conn.close(true);
        }
    }

    fn install(&self, conn: &WsConnection) {
        let mut rx = conn.subscribe_state();
        let generation = self.status.reset(*rx.borrow_and_update());

        if let Some(previous) = self.connection.lock().replace(conn.clone()) {
            previous.close(true);
        }

        let status = self.status.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if !status.publish(generation, state) || state.is_terminal() {
                    break;
                }
            }
        });
    }

    async fn relay_messages(&self, conn: &WsConnection, cancel: &CancellationToken) -> RelayExit {
        loop {
            if !conn.is_connected() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return RelayExit::Cancelled,
                    up = conn.wait_until_connected() => {
                        if !up {
                            return RelayExit::UpstreamClosed;
                        }
                    }
                }
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RelayExit::Cancelled,
                read = conn.read_message() => read,
            };

            match read {
                Ok(Some(Message::Text(text))) => {
                    let notification = Notification::from(text.as_str());
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return RelayExit::Cancelled,
                        sent = self.broadcast.send(notification) => {
                            if sent.is_err() {
                                tracing::warn!("hub broadcast channel closed, stopping relay");
                                return RelayExit::HubClosed;
                            }
                        }
                    }
                }
                Ok(Some(other)) => {
                    tracing::warn!("[wsclient] wont relay non-text message: {}", frame_kind(&other));
                }
                Ok(None) => return RelayExit::UpstreamClosed,
                // Raced with a reconnect; wait for the next link.
                Err(WsError::NotConnected) => {}
                Err(e) => tracing::error!("failed to read upstream message: {}", e),
            }
        }
    }
}

impl Drop for UpstreamRelay {
    fn drop(&mut self) {
        self.close();
    }
}

fn frame_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}
