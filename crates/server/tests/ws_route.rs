//! The HTTP surface served on a real socket.

use futures_util::{SinkExt, StreamExt};
use phantomias_server::{router, AppState, RelayHub, WsLimits, WsLimitsConfig};
use phantomias_shared::{ConnectionState, Notification};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    hub: RelayHub,
    upstream: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

async fn start() -> TestServer {
    start_with(WsLimits::default()).await
}

async fn start_with(limits: WsLimits) -> TestServer {
    let shutdown = CancellationToken::new();
    let (hub, _hub_task) = RelayHub::spawn(16, shutdown.clone());
    let (upstream, upstream_rx) = watch::channel(ConnectionState::Connected);
    let state = AppState::new(hub.clone(), upstream_rx, shutdown.clone()).with_ws_limits(limits);
    let app = router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        hub,
        upstream,
        shutdown,
    }
}

async fn wait_for_subscribers(hub: &RelayHub, want: usize) {
    timeout(Duration::from_secs(5), async {
        while hub.subscriber_count().await.unwrap() != want {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw {} subscribers", want));
}

/// Minimal HTTP/1.1 GET returning status code and body.
async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    tcp.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    timeout(Duration::from_secs(5), tcp.read_to_string(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn subscribers_receive_broadcasts() {
    let server = start().await;
    let url = format!("ws://{}/v1/ws", server.addr);

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_subscribers(&server.hub, 2).await;

    let snapshot = server.hub.snapshot().await.unwrap();
    assert!(snapshot
        .iter()
        .all(|info| info.remote_addr.map(|a| a.ip().is_loopback()) == Some(true)));

    server
        .hub
        .broadcast(Notification::from(r#"{"type":"block","height":812345}"#))
        .await
        .unwrap();

    for client in [&mut first, &mut second] {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Text(r#"{"type":"block","height":812345}"#.into()));
    }

    first.close(None).await.unwrap();
    wait_for_subscribers(&server.hub, 1).await;
}

#[tokio::test]
async fn binary_payloads_go_out_as_binary_frames() {
    let server = start().await;
    let url = format!("ws://{}/v1/ws", server.addr);

    let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_subscribers(&server.hub, 1).await;

    server
        .hub
        .broadcast(Notification::from(vec![0xff, 0xfe, 0x00]))
        .await
        .unwrap();

    let msg = timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::Binary(vec![0xff, 0xfe, 0x00].into()));
}

#[tokio::test]
async fn health_reports_upstream_and_subscribers() {
    let server = start().await;
    let url = format!("ws://{}/v1/ws", server.addr);
    let (_client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_subscribers(&server.hub, 1).await;

    let (status, body) = get(server.addr, "/health").await;
    assert_eq!(status, 200);
    let report: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["status"], "ok");
    assert_eq!(report["upstream"], "connected");
    assert_eq!(report["subscribers"], 1);

    server.upstream.send_replace(ConnectionState::Connecting);
    let (_, body) = get(server.addr, "/health").await;
    let report: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["status"], "degraded");
    assert_eq!(report["upstream"], "connecting");
}

#[tokio::test]
async fn health_is_unavailable_once_the_hub_stops() {
    let server = start().await;
    server.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = get(server.addr, "/health").await;
    assert_eq!(status, 503);
    let problem: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        problem["type"],
        "https://phantomias.dev/problems/service-unavailable"
    );
}

#[tokio::test]
async fn unknown_paths_are_problem_documents() {
    let server = start().await;

    let (status, body) = get(server.addr, "/v1/nope").await;
    assert_eq!(status, 404);
    let problem: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(problem["detail"], "no route for /v1/nope");
}

#[tokio::test]
async fn upgrades_past_the_limit_are_refused() {
    let server = start_with(WsLimits::new(&WsLimitsConfig {
        rate_limit: 2,
        rate_window: Duration::from_secs(60),
        exempt_loopback: false,
        handshake_timeout: Duration::from_secs(20),
    }))
    .await;
    let url = format!("ws://{}/v1/ws", server.addr);

    let (_first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (_second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let err = tokio_tungstenite::connect_async(url.as_str())
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status().as_u16(), 429);
        }
        other => panic!("expected an HTTP refusal, got {:?}", other),
    }
    wait_for_subscribers(&server.hub, 2).await;
}

#[tokio::test]
async fn loopback_is_exempt_by_default() {
    let server = start().await;
    let url = format!("ws://{}/v1/ws", server.addr);

    let mut clients = Vec::new();
    for _ in 0..5 {
        let (client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        clients.push(client);
    }
    wait_for_subscribers(&server.hub, 5).await;
}

#[tokio::test]
async fn plain_get_on_the_socket_route_needs_an_upgrade() {
    let server = start().await;

    let (status, _) = get(server.addr, "/v1/ws").await;
    assert_eq!(status, 426);
}
