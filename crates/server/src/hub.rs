//! Relay hub: fans each upstream notification out to every subscriber.
//!
//! The registry lives inside a single [`HubLoop`] task and is only touched
//! there; everything else talks to it over channels through a [`RelayHub`]
//! handle. Each delivery runs in its own task and takes the subscriber's own
//! lock, so a slow socket only holds up itself.

use async_trait::async_trait;
use futures_util::FutureExt;
use phantomias_shared::metrics::{BROADCASTS_TOTAL, SUBSCRIBERS, SUBSCRIBERS_TOTAL};
use phantomias_shared::Notification;
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type SubscriberId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("relay hub has stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("subscriber connection is gone")]
    Gone,
    #[error("write failed: {0}")]
    Write(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Write half of a downstream connection.
#[async_trait]
pub trait SubscriberSink: Send + 'static {
    async fn send(&mut self, notification: &Notification) -> Result<(), SinkError>;

    /// Best-effort close; errors are ignored.
    async fn close(&mut self);
}

/// A downstream connection handed to the hub on registration.
pub struct Subscriber {
    pub id: SubscriberId,
    pub remote_addr: Option<SocketAddr>,
    sink: Box<dyn SubscriberSink>,
}

impl Subscriber {
    pub fn new(
        id: SubscriberId,
        remote_addr: Option<SocketAddr>,
        sink: impl SubscriberSink,
    ) -> Self {
        Self {
            id,
            remote_addr,
            sink: Box::new(sink),
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Registry entry as reported by [`RelayHub::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub remote_addr: Option<SocketAddr>,
}

struct Slot {
    closing: bool,
    sink: Box<dyn SubscriberSink>,
}

struct Entry {
    remote_addr: Option<SocketAddr>,
    slot: Arc<Mutex<Slot>>,
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct RelayHub {
    register_tx: mpsc::Sender<Subscriber>,
    unregister_tx: mpsc::Sender<SubscriberId>,
    broadcast_tx: mpsc::Sender<Notification>,
    snapshot_tx: mpsc::Sender<oneshot::Sender<Vec<SubscriberInfo>>>,
    cancel: CancellationToken,
}

/// The hub's event loop. Owns the registry.
pub struct HubLoop {
    register_rx: mpsc::Receiver<Subscriber>,
    unregister_rx: mpsc::Receiver<SubscriberId>,
    unregister_tx: mpsc::Sender<SubscriberId>,
    broadcast_rx: mpsc::Receiver<Notification>,
    snapshot_rx: mpsc::Receiver<oneshot::Sender<Vec<SubscriberInfo>>>,
    cancel: CancellationToken,
    subscribers: HashMap<SubscriberId, Entry>,
}

impl RelayHub {
    /// Creates a hub handle and the loop that serves it. Every channel holds
    /// up to `capacity` pending requests.
    pub fn new(capacity: usize, cancel: CancellationToken) -> (RelayHub, HubLoop) {
        let capacity = capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(capacity);

        let hub = RelayHub {
            register_tx,
            unregister_tx: unregister_tx.clone(),
            broadcast_tx,
            snapshot_tx,
            cancel: cancel.clone(),
        };
        let hub_loop = HubLoop {
            register_rx,
            unregister_rx,
            unregister_tx,
            broadcast_rx,
            snapshot_rx,
            cancel,
            subscribers: HashMap::new(),
        };
        (hub, hub_loop)
    }

    /// Creates a hub and runs its loop on a new task.
    pub fn spawn(capacity: usize, cancel: CancellationToken) -> (RelayHub, JoinHandle<()>) {
        let (hub, hub_loop) = Self::new(capacity, cancel);
        (hub, tokio::spawn(hub_loop.run()))
    }

    pub async fn register(&self, subscriber: Subscriber) -> Result<(), HubError> {
        self.register_tx
            .send(subscriber)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub async fn unregister(&self, id: SubscriberId) -> Result<(), HubError> {
        self.unregister_tx
            .send(id)
            .await
            .map_err(|_| HubError::Stopped)
    }

    pub async fn broadcast(&self, notification: Notification) -> Result<(), HubError> {
        self.broadcast_tx
            .send(notification)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Channel feeding the hub's broadcasts, for the upstream relay.
    pub fn broadcast_sender(&self) -> mpsc::Sender<Notification> {
        self.broadcast_tx.clone()
    }

    /// Current registry contents, as seen by the loop.
    pub async fn snapshot(&self) -> Result<Vec<SubscriberInfo>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.snapshot_tx
            .send(reply_tx)
            .await
            .map_err(|_| HubError::Stopped)?;
        reply_rx.await.map_err(|_| HubError::Stopped)
    }

    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        Ok(self.snapshot().await?.len())
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl HubLoop {
    /// Serves requests until the cancellation token fires.
    pub async fn run(mut self) {
        tracing::info!("relay hub started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(subscriber) = self.register_rx.recv() => self.add(subscriber),
                Some(id) = self.unregister_rx.recv() => self.remove(id),
                Some(notification) = self.broadcast_rx.recv() => self.fan_out(notification),
                Some(reply) = self.snapshot_rx.recv() => {
                    let _ = reply.send(self.snapshot());
                }
                else => break,
            }
        }

        tracing::info!(
            "relay hub stopped with {} subscribers registered",
            self.subscribers.len()
        );
    }

    fn add(&mut self, subscriber: Subscriber) {
        let Subscriber {
            id,
            remote_addr,
            sink,
        } = subscriber;

        self.subscribers.insert(
            id,
            Entry {
                remote_addr,
                slot: Arc::new(Mutex::new(Slot {
                    closing: false,
                    sink,
                })),
            },
        );
        metrics::counter!(SUBSCRIBERS_TOTAL).increment(1);
        metrics::gauge!(SUBSCRIBERS).set(self.subscribers.len() as f64);
        tracing::info!(
            "subscriber {} registered from {} (active={})",
            id,
            display_addr(remote_addr),
            self.subscribers.len()
        );
    }

    fn remove(&mut self, id: SubscriberId) {
        if let Some(entry) = self.subscribers.remove(&id) {
            metrics::gauge!(SUBSCRIBERS).set(self.subscribers.len() as f64);
            tracing::info!(
                "subscriber {} unregistered from {} (active={})",
                id,
                display_addr(entry.remote_addr),
                self.subscribers.len()
            );
        }
    }

    fn fan_out(&self, notification: Notification) {
        metrics::counter!(BROADCASTS_TOTAL).increment(1);
        tracing::debug!(
            "broadcasting {} bytes to {} subscribers",
            notification.len(),
            self.subscribers.len()
        );

        for (id, entry) in &self.subscribers {
            tokio::spawn(deliver(
                *id,
                entry.slot.clone(),
                notification.clone(),
                self.unregister_tx.clone(),
            ));
        }
    }

    fn snapshot(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .iter()
            .map(|(id, entry)| SubscriberInfo {
                id: *id,
                remote_addr: entry.remote_addr,
            })
            .collect()
    }
}

/// Writes one notification to one subscriber. A failed or panicking write
/// marks the subscriber closing, closes its socket and unregisters it.
async fn deliver(
    id: SubscriberId,
    slot: Arc<Mutex<Slot>>,
    notification: Notification,
    unregister: mpsc::Sender<SubscriberId>,
) {
    let mut slot = slot.lock().await;
    if slot.closing {
        return;
    }

    let failure = match AssertUnwindSafe(slot.sink.send(&notification))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("write panicked: {}", panic_message(&*panic)),
    };

    slot.closing = true;
    tracing::warn!("write error for subscriber {}: {}", id, failure);

    if AssertUnwindSafe(slot.sink.close())
        .catch_unwind()
        .await
        .is_err()
    {
        tracing::warn!("closing subscriber {} panicked", id);
    }
    drop(slot);

    let _ = unregister.send(id).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
