//! HTTP CONNECT tunnelling for the upstream dial.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::ws::error::{Result, WsError};

/// Chooses the proxy for a target url; `None` dials directly.
pub type ProxyFn = Arc<dyn Fn(&Url) -> Option<Url> + Send + Sync>;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Proxy selection from `HTTPS_PROXY`, `HTTP_PROXY`, `ALL_PROXY` and `NO_PROXY`.
///
/// `wss` targets use the https variables and `ws` targets the http ones.
pub fn proxy_from_env(target: &Url) -> Option<Url> {
    proxy_from_lookup(target, |key| {
        std::env::var(key)
            .or_else(|_| std::env::var(key.to_lowercase()))
            .ok()
    })
}

/// Never use a proxy.
pub fn no_proxy(_target: &Url) -> Option<Url> {
    None
}

pub(crate) fn proxy_from_lookup(
    target: &Url,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<Url> {
    let host = target.host_str()?;

    if let Some(no_proxy) = lookup("NO_PROXY") {
        if bypasses_proxy(host, &no_proxy) {
            return None;
        }
    }

    let scheme_var = if target.scheme() == "wss" {
        "HTTPS_PROXY"
    } else {
        "HTTP_PROXY"
    };

    let raw = lookup(scheme_var)
        .filter(|v| !v.trim().is_empty())
        .or_else(|| lookup("ALL_PROXY").filter(|v| !v.trim().is_empty()))?;
    let raw = raw.trim();

    if raw.contains("://") {
        Url::parse(raw).ok()
    } else {
        Url::parse(&format!("http://{}", raw)).ok()
    }
}

fn bypasses_proxy(host: &str, no_proxy: &str) -> bool {
    no_proxy
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }
            let entry = entry.split(':').next().unwrap_or(entry);
            let suffix = entry.trim_start_matches('.');
            host == suffix || host.ends_with(&format!(".{}", suffix))
        })
}

/// Opens a TCP tunnel to `target` through an HTTP proxy.
pub(crate) async fn connect_via_proxy(proxy: &Url, target: &Url) -> Result<TcpStream> {
    if proxy.scheme() != "http" {
        return Err(WsError::Proxy(format!(
            "unsupported proxy scheme {:?}",
            proxy.scheme()
        )));
    }

    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| WsError::Proxy("proxy url has no host".to_string()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    let target_host = target
        .host_str()
        .ok_or_else(|| WsError::Proxy("target url has no host".to_string()))?;
    let target_port = target
        .port_or_known_default()
        .ok_or_else(|| WsError::Proxy("target url has no port".to_string()))?;
    let authority = format!("{}:{}", target_host, target_port);

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| WsError::Proxy(format!("connect to {}:{}: {}", proxy_host, proxy_port, e)))?;

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!(
            "{}:{}",
            proxy.username(),
            proxy.password().unwrap_or_default()
        );
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| WsError::Proxy(format!("write CONNECT: {}", e)))?;

    let head = read_response_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(WsError::Proxy(format!(
            "proxy refused tunnel: {}",
            status_line.trim()
        )));
    }

    Ok(stream)
}

async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    // Byte at a time so nothing past the head is consumed from the tunnel.
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(WsError::Proxy("proxy response head too large".to_string()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| WsError::Proxy(format!("read CONNECT response: {}", e)))?;
        if n == 0 {
            return Err(WsError::Proxy(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn picks_proxy_by_scheme() {
        let vars = lookup(&[
            ("HTTP_PROXY", "http://plain-proxy:3128"),
            ("HTTPS_PROXY", "secure-proxy:8443"),
        ]);

        let ws = Url::parse("ws://pool.example.com/notifications").unwrap();
        let wss = Url::parse("wss://pool.example.com/notifications").unwrap();

        assert_eq!(
            proxy_from_lookup(&ws, &vars).unwrap().as_str(),
            "http://plain-proxy:3128/"
        );
        assert_eq!(
            proxy_from_lookup(&wss, &vars).unwrap().as_str(),
            "http://secure-proxy:8443/"
        );
    }

    #[test]
    fn no_proxy_bypasses_matching_hosts() {
        let vars = lookup(&[
            ("ALL_PROXY", "http://proxy:3128"),
            ("NO_PROXY", "localhost, .internal"),
        ]);

        let local = Url::parse("ws://localhost:5000/ws").unwrap();
        let internal = Url::parse("ws://pool.internal/ws").unwrap();
        let external = Url::parse("ws://pool.example.com/ws").unwrap();

        assert!(proxy_from_lookup(&local, &vars).is_none());
        assert!(proxy_from_lookup(&internal, &vars).is_none());
        assert!(proxy_from_lookup(&external, &vars).is_some());
    }

    #[test]
    fn no_variables_means_direct() {
        let target = Url::parse("ws://pool.example.com/ws").unwrap();
        assert!(proxy_from_lookup(&target, lookup(&[])).is_none());
    }

    async fn fake_proxy(reply: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_response_head(&mut socket).await.unwrap();
            socket.write_all(reply.as_bytes()).await.unwrap();
            head
        });
        let url = Url::parse(&format!("http://user:secret@{}", addr)).unwrap();
        (url, handle)
    }

    #[tokio::test]
    async fn connect_sends_tunnel_request() {
        let (proxy, handle) = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let target = Url::parse("wss://pool.example.com/notifications").unwrap();

        connect_via_proxy(&proxy, &target).await.unwrap();

        let request = handle.await.unwrap();
        assert!(request.starts_with("CONNECT pool.example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"));
    }

    #[tokio::test]
    async fn connect_rejects_refused_tunnel() {
        let (proxy, _handle) = fake_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let target = Url::parse("ws://pool.example.com/notifications").unwrap();

        let err = connect_via_proxy(&proxy, &target).await.unwrap_err();
        assert!(matches!(err, WsError::Proxy(msg) if msg.contains("407")));
    }
}
