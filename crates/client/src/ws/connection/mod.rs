//! Self-healing upstream WebSocket connection.
//!
//! [`WsConnection`] owns at most one live transport at a time and replaces it
//! wholesale on every successful dial. Read and write failures close the
//! transport and start a background reconnect loop with exponential backoff,
//! so callers only ever see the error of the call that hit the failure.
//!
//! ```text
//!   Closed ──dial ok──▶ Connected ──read/write error──▶ Closed ──▶ Connecting ──dial ok──▶ Connected
//!      │                    │                                         │
//!      └───────────── close(forever) ─────────────────────────────────┴──▶ ClosedForever
//! ```

mod backoff;
mod keepalive;
mod options;
pub mod proxy;

pub use backoff::Backoff;
pub use keepalive::KeepAliveTracker;
pub use options::{ConnectionOptions, LogFns};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use phantomias_shared::metrics::UPSTREAM_RECONNECTS_TOTAL;
use phantomias_shared::ConnectionState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Response;
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{
    client_async_tls_with_config, connect_async_tls_with_config, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ws::error::{Result, UrlError, WsError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PING_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Status and headers of the opening handshake response.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl From<&Response> for HandshakeResponse {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
        }
    }
}

/// One dialed transport. Both halves carry their own lock: the sink lock is
/// the single-writer lock shared by writes and keep-alive pings.
struct Link {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WsStream>>,
    /// Fired when the link is closed locally; aborts in-flight reads and writes.
    closed: CancellationToken,
    tracker: KeepAliveTracker,
}

impl Link {
    fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            closed: CancellationToken::new(),
            tracker: KeepAliveTracker::new(),
        }
    }
}

struct Shared {
    state: ConnectionState,
    link: Option<Arc<Link>>,
    keep_alive: Option<CancellationToken>,
    handshake: Option<HandshakeResponse>,
    /// Bumped every time a dial starts; a dial only commits if it still owns the epoch.
    epoch: u64,
    /// Set once a close frame has been sent by `shutdown`.
    shutting_down: bool,
}

struct Inner {
    url: Url,
    opts: ConnectionOptions,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    /// Cancelled by `close(true)`; parent of every keep-alive token.
    lifetime: CancellationToken,
}

/// A WebSocket client connection that reconnects on failure.
///
/// Cheap to clone; all clones drive the same connection. Must be used from
/// within a Tokio runtime because reconnects and keep-alive run as tasks.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

/// Checks that `raw` is a `ws`/`wss` url without credentials.
pub fn validate_url(raw: &str) -> std::result::Result<Url, UrlError> {
    if raw.is_empty() {
        return Err(UrlError::Empty);
    }

    let url = Url::parse(raw)?;

    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(UrlError::Scheme(url.scheme().to_string()));
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlError::UserInfo);
    }

    Ok(url)
}

impl WsConnection {
    /// Creates a closed connection. Nothing is dialed until [`dial`](Self::dial).
    pub fn new(url: &str, opts: ConnectionOptions) -> Result<Self> {
        let url = validate_url(url)?;
        let (state_tx, _) = watch::channel(ConnectionState::Closed);

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                opts,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Closed,
                    link: None,
                    keep_alive: None,
                    handshake: None,
                    epoch: 0,
                    shutting_down: false,
                }),
                state_tx,
                lifetime: CancellationToken::new(),
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// True only while a transport is up, not while one is being dialed.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receives every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Waits until connected. Returns `false` once the connection is closed forever.
    pub async fn wait_until_connected(&self) -> bool {
        let mut rx = self.subscribe_state();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Connected => return true,
                ConnectionState::ClosedForever => return false,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Response of the most recent successful handshake.
    pub fn handshake_response(&self) -> Option<HandshakeResponse> {
        self.inner.shared.lock().handshake.clone()
    }

    /// Dials the server once.
    ///
    /// A no-op if a dial is already running, the connection is up, or it was
    /// closed forever. A failed first dial is returned, not retried.
    pub async fn dial(&self) -> Result<()> {
        self.dial_with_cancel(&CancellationToken::new()).await
    }

    /// Like [`dial`](Self::dial), abandoning the attempt when `cancel` fires.
    pub async fn dial_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        let epoch = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                ConnectionState::ClosedForever => {
                    drop(shared);
                    self.debug("Dial: connection is closed forever, not dialing");
                    return Ok(());
                }
                ConnectionState::Closed => self.begin_dial(&mut shared),
            }
        };

        match self.establish(epoch, cancel).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let mut shared = self.inner.shared.lock();
                if shared.epoch == epoch && shared.state == ConnectionState::Connecting {
                    self.set_state(&mut shared, ConnectionState::Closed);
                }
                Err(err)
            }
        }
    }

    /// Reads the next data frame.
    ///
    /// Returns `Ok(None)` when the server closed normally and the connection
    /// is configured to respect that; the connection is then closed forever.
    /// Any other failure starts a background reconnect and is returned.
    pub async fn read_message(&self) -> Result<Option<Message>> {
        let link = self.current_link()?;

        let mut stream = tokio::select! {
            biased;
            _ = link.closed.cancelled() => return Err(WsError::NotConnected),
            guard = link.stream.lock() => guard,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = link.closed.cancelled() => return Err(WsError::NotConnected),
                next = stream.next() => next,
            };

            let err = match next {
                Some(Ok(Message::Pong(_))) => {
                    link.tracker.touch();
                    continue;
                }
                // Pings are answered by the transport.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code, f.reason.to_string()))
                        .unwrap_or((CloseCode::Status, String::new()));
                    WsError::Closed { code, reason }
                }
                Some(Ok(msg)) => return Ok(Some(msg)),
                Some(Err(e)) => WsError::Transport(e),
                None => WsError::Transport(tungstenite::Error::ConnectionClosed),
            };
            drop(stream);

            if self.is_shutting_down() || self.is_respected_closure(&err) {
                self.debug("Read: server closed the connection, not reconnecting");
                self.close(true);
                return Ok(None);
            }

            self.fail_link(&link, &err, "read error");
            return Err(err);
        }
    }

    /// Reads the next data frame and decodes it as JSON.
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.read_message().await? {
            None => Ok(None),
            Some(Message::Text(text)) => Ok(Some(serde_json::from_str(text.as_str())?)),
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.into_data())?)),
        }
    }

    /// Writes one message under the connection's write lock.
    pub async fn write_message(&self, msg: Message) -> Result<()> {
        let link = self.current_link()?;

        let result = {
            let mut sink = tokio::select! {
                biased;
                _ = link.closed.cancelled() => return Err(WsError::NotConnected),
                guard = link.sink.lock() => guard,
            };
            tokio::select! {
                biased;
                _ = link.closed.cancelled() => return Err(WsError::NotConnected),
                result = sink.send(msg) => result,
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = WsError::Transport(e);
                self.fail_link(&link, &err, "write error");
                Err(err)
            }
        }
    }

    /// Writes the JSON encoding of `value` as a text frame.
    pub async fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        if !self.is_connected() {
            return Err(WsError::NotConnected);
        }
        let json = serde_json::to_string(value)?;
        self.write_message(Message::Text(json.into())).await
    }

    /// Drops the transport without a close handshake and reconnects in the background.
    pub fn close_and_reconnect(&self) {
        self.close(false);
        self.spawn_reconnect();
    }

    /// Drops the transport without a close handshake.
    ///
    /// With `forever` the connection never dials again. Closing a closed
    /// connection does nothing.
    pub fn close(&self, forever: bool) {
        self.close_link(forever, None);
    }

    /// Sends a normal-closure frame and waits up to `write_wait` for the
    /// peer's reply before closing forever. Falls back to [`close(true)`](Self::close)
    /// if the frame cannot be sent.
    pub async fn shutdown(&self, write_wait: Duration) {
        let link = {
            let mut shared = self.inner.shared.lock();
            let live = match shared.state {
                ConnectionState::Closed | ConnectionState::ClosedForever => None,
                _ => shared.link.clone(),
            };
            match live {
                Some(link) => {
                    shared.shutting_down = true;
                    link
                }
                None => {
                    drop(shared);
                    self.close(true);
                    return;
                }
            }
        };

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let sent = tokio::time::timeout(write_wait, async {
            let mut sink = link.sink.lock().await;
            sink.send(Message::Close(Some(frame))).await
        })
        .await;

        match sent {
            Ok(Ok(())) => {
                let _ = tokio::time::timeout(write_wait, self.await_close_reply(&link)).await;
            }
            Ok(Err(e)) => self.error(&WsError::Transport(e), "shutdown error"),
            Err(_) => self.error(&WsError::HandshakeTimeout(write_wait), "shutdown error"),
        }

        self.close(true);
    }

    fn begin_dial(&self, shared: &mut Shared) -> u64 {
        shared.epoch += 1;
        self.set_state(shared, ConnectionState::Connecting);
        shared.epoch
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        shared.state = state;
        self.inner.state_tx.send_replace(state);
    }

    /// Dials and, if this attempt still owns `epoch`, installs the new link.
    ///
    /// Returns `Ok(false)` when the connection was closed or re-dialed while
    /// this attempt was in flight; the new transport is dropped in that case.
    async fn establish(&self, epoch: u64, cancel: &CancellationToken) -> Result<bool> {
        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WsError::Cancelled),
            _ = self.inner.lifetime.cancelled() => Err(WsError::Cancelled),
            dialed = self.connect_transport() => dialed,
        };
        let (ws, response) = dialed?;

        let link = Arc::new(Link::new(ws));
        let keep_alive = {
            let mut shared = self.inner.shared.lock();
            if shared.epoch != epoch || shared.state != ConnectionState::Connecting {
                return Ok(false);
            }

            shared.link = Some(link.clone());
            shared.handshake = Some(HandshakeResponse::from(&response));
            shared.shutting_down = false;
            self.set_state(&mut shared, ConnectionState::Connected);

            if let Some(previous) = shared.keep_alive.take() {
                previous.cancel();
            }
            if self.inner.opts.keep_alive_enabled() {
                let token = self.inner.lifetime.child_token();
                shared.keep_alive = Some(token.clone());
                Some(token)
            } else {
                None
            }
        };

        (self.inner.opts.on_connect)();
        if let Some(token) = keep_alive {
            self.spawn_keep_alive(link, token);
        }
        self.debug(&format!(
            "Dial: connection successfully established with {}",
            self.inner.url
        ));

        Ok(true)
    }

    async fn connect_transport(&self) -> Result<(WsStream, Response)> {
        let opts = &self.inner.opts;
        let url = &self.inner.url;

        let mut request = url.as_str().into_client_request().map_err(WsError::Dial)?;
        request
            .headers_mut()
            .extend(opts.request_headers.clone());

        let connect = async {
            match opts.proxy_for(url) {
                Some(proxy) => {
                    self.debug(&format!("Dial: tunnelling through proxy {}", proxy));
                    let tcp = proxy::connect_via_proxy(&proxy, url).await?;
                    client_async_tls_with_config(request, tcp, None, opts.tls_connector.clone())
                        .await
                        .map_err(WsError::Dial)
                }
                None => {
                    connect_async_tls_with_config(request, None, false, opts.tls_connector.clone())
                        .await
                        .map_err(WsError::Dial)
                }
            }
        };

        if opts.handshake_timeout.is_zero() {
            return connect.await;
        }
        tokio::time::timeout(opts.handshake_timeout, connect)
            .await
            .map_err(|_| WsError::HandshakeTimeout(opts.handshake_timeout))?
    }

    fn spawn_reconnect(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            conn.reconnect().await;
        });
    }

    /// Dials with backoff until connected, superseded, or closed forever.
    async fn reconnect(&self) {
        let epoch = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                ConnectionState::Closed => self.begin_dial(&mut shared),
                _ => return,
            }
        };

        let mut backoff = Backoff::from_options(&self.inner.opts);
        let lifetime = self.inner.lifetime.clone();

        loop {
            let err = match self.establish(epoch, &lifetime).await {
                Ok(true) => {
                    metrics::counter!(UPSTREAM_RECONNECTS_TOTAL).increment(1);
                    return;
                }
                Err(WsError::Cancelled) => return,
                // The fresh transport was dropped by a close(false) mid-dial.
                Ok(false) => {
                    if !self.resume_reconnect(epoch) {
                        return;
                    }
                    continue;
                }
                Err(err) => err,
            };

            if !self.resume_reconnect(epoch) {
                return;
            }

            let wait = backoff.next_delay();
            self.error(
                &err,
                &format!(
                    "dial error, will try again in {:.3} seconds",
                    wait.as_secs_f64()
                ),
            );

            tokio::select! {
                _ = lifetime.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            if !self.resume_reconnect(epoch) {
                return;
            }
        }
    }

    /// Whether the reconnect loop owning `epoch` should keep dialing.
    ///
    /// A close(false) since the last attempt does not stop the loop: the
    /// state goes back to `Connecting` and the next dial proceeds.
    fn resume_reconnect(&self, epoch: u64) -> bool {
        let mut shared = self.inner.shared.lock();
        if shared.epoch != epoch {
            return false;
        }
        match shared.state {
            ConnectionState::ClosedForever | ConnectionState::Connected => false,
            ConnectionState::Connecting => true,
            ConnectionState::Closed => {
                self.set_state(&mut shared, ConnectionState::Connecting);
                true
            }
        }
    }

    fn spawn_keep_alive(&self, link: Arc<Link>, token: CancellationToken) {
        let every = self.inner.opts.keep_alive_timeout;

        {
            let conn = self.clone();
            let link = link.clone();
            let token = token.clone();
            tokio::spawn(async move {
                keepalive::run_pinger(every, token, move || {
                    let conn = conn.clone();
                    let link = link.clone();
                    async move { conn.write_ping(&link).await }
                })
                .await;
            });
        }

        let conn = self.clone();
        tokio::spawn(async move {
            keepalive::watch_liveness(&link.tracker, every, token, || {
                conn.debug("keep-alive: no pong within timeout, reconnecting");
                conn.reconnect_link(&link);
            })
            .await;
        });
    }

    async fn write_ping(&self, link: &Link) {
        let sent = tokio::select! {
            biased;
            _ = link.closed.cancelled() => return,
            sent = tokio::time::timeout(PING_WRITE_WAIT, async {
                let mut sink = link.sink.lock().await;
                sink.send(Message::Ping(Vec::new().into())).await
            }) => sent,
        };

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.error(&WsError::Transport(e), "error in writing ping message"),
            Err(_) => self.error(
                &WsError::HandshakeTimeout(PING_WRITE_WAIT),
                "error in writing ping message",
            ),
        }
    }

    async fn await_close_reply(&self, link: &Link) {
        let Ok(mut stream) = link.stream.try_lock() else {
            // An active reader sees the reply and closes the link.
            link.closed.cancelled().await;
            return;
        };

        loop {
            tokio::select! {
                biased;
                _ = link.closed.cancelled() => return,
                next = stream.next() => match next {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(Message::Pong(_))) => link.tracker.touch(),
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Returns the live link, or `NotConnected` unless exactly `Connected`.
    fn current_link(&self) -> Result<Arc<Link>> {
        let shared = self.inner.shared.lock();
        match (shared.state, shared.link.as_ref()) {
            (ConnectionState::Connected, Some(link)) => Ok(link.clone()),
            _ => Err(WsError::NotConnected),
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shared.lock().shutting_down
    }

    fn is_respected_closure(&self, err: &WsError) -> bool {
        self.inner.opts.respect_server_closure
            && matches!(err, WsError::Closed { code: CloseCode::Normal, .. })
    }

    /// Logs `err` and reconnects, unless `link` has already been replaced.
    fn fail_link(&self, link: &Arc<Link>, err: &WsError, context: &str) {
        self.error(err, context);
        self.reconnect_link(link);
    }

    fn reconnect_link(&self, link: &Arc<Link>) {
        if self.close_link(false, Some(link)) {
            self.spawn_reconnect();
        }
    }

    /// Closes the current link, or only `expected` if given.
    /// Returns whether a link was closed.
    fn close_link(&self, forever: bool, expected: Option<&Arc<Link>>) -> bool {
        let link = {
            let mut shared = self.inner.shared.lock();

            if let Some(expected) = expected {
                let is_current = shared
                    .link
                    .as_ref()
                    .map(|current| Arc::ptr_eq(current, expected))
                    .unwrap_or(false);
                if !is_current {
                    return false;
                }
            }

            if let Some(token) = shared.keep_alive.take() {
                token.cancel();
            }

            match (shared.state, forever) {
                (ConnectionState::ClosedForever, _) | (ConnectionState::Closed, false) => {
                    return false;
                }
                _ => {}
            }

            if forever {
                self.inner.lifetime.cancel();
            }
            let next = if forever {
                ConnectionState::ClosedForever
            } else {
                ConnectionState::Closed
            };
            self.set_state(&mut shared, next);
            shared.link.take()
        };

        match link {
            Some(link) => {
                link.closed.cancel();
                self.debug(&format!("Close: connection to {} closed", self.inner.url));
                true
            }
            None => false,
        }
    }

    fn debug(&self, msg: &str) {
        (self.inner.opts.log.debug)(msg);
    }

    fn error(&self, err: &WsError, msg: &str) {
        (self.inner.opts.log.error)(err, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_urls() {
        assert!(matches!(validate_url(""), Err(UrlError::Empty)));
        assert!(matches!(validate_url("not a url"), Err(UrlError::Parse(_))));
        assert!(matches!(
            validate_url("http://example.com"),
            Err(UrlError::Scheme(scheme)) if scheme == "http"
        ));
        assert!(matches!(
            validate_url("ws://user:pass@example.com"),
            Err(UrlError::UserInfo)
        ));
        assert!(matches!(
            validate_url("wss://user@example.com"),
            Err(UrlError::UserInfo)
        ));
    }

    #[test]
    fn accepts_ws_and_wss() {
        assert!(validate_url("ws://localhost:5000/notifications").is_ok());
        assert!(validate_url("wss://pool.example.com/notifications").is_ok());
    }

    #[test]
    fn construction_fails_without_a_client() {
        let err = WsConnection::new("http://example.com", ConnectionOptions::default()).unwrap_err();
        assert!(matches!(err, WsError::InvalidUrl(UrlError::Scheme(_))));
    }

    #[tokio::test]
    async fn reads_and_writes_need_a_connection() {
        let conn = WsConnection::new("ws://127.0.0.1:9/ws", ConnectionOptions::default()).unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.read_message().await, Err(WsError::NotConnected)));
        assert!(matches!(
            conn.write_message(Message::Text("hi".into())).await,
            Err(WsError::NotConnected)
        ));
        assert!(matches!(conn.write_json(&[1, 2, 3]).await, Err(WsError::NotConnected)));
    }

    #[tokio::test]
    async fn closed_forever_is_terminal() {
        let conn = WsConnection::new("ws://127.0.0.1:9/ws", ConnectionOptions::default()).unwrap();

        conn.close(true);
        assert_eq!(conn.state(), ConnectionState::ClosedForever);

        // Dialing a terminal connection is a no-op, not an error.
        conn.dial().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::ClosedForever);

        conn.close(false);
        conn.close_and_reconnect();
        tokio::task::yield_now().await;
        assert_eq!(conn.state(), ConnectionState::ClosedForever);
        assert!(!conn.is_connected());
        assert!(!conn.wait_until_connected().await);
    }
}
