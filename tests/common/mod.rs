//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use intercept_proxy::net::tls::{self, TlsIdentity};
use intercept_proxy::{Proxy, ProxyConfig, ProxyHooks};

/// A keep-alive HTTP/1.1 origin speaking raw bytes.
///
/// Every response carries the request-target and the request's `echo`
/// header back in `target` / `echo` headers and echoes the request body.
/// A request with an `Upgrade` header is answered with `101` and the
/// connection then echoes raw bytes.
pub struct MockOrigin {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl MockOrigin {
    /// Connections the origin has accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Start a plain-text mock origin on an ephemeral port.
pub async fn start_origin() -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_http(socket));
        }
    });

    MockOrigin { addr, connections }
}

/// Start a TLS mock origin using the built-in localhost identity.
pub async fn start_tls_origin() -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let config = tls::server_config(&TlsIdentity::localhost().unwrap()).unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let config = Arc::clone(&config);
            tokio::spawn(async move {
                if let Ok(stream) = tls::accept(config, socket, Duration::from_secs(5)).await {
                    serve_http(stream).await;
                }
            });
        }
    });

    MockOrigin { addr, connections }
}

/// Start an origin that answers its first request with a `len`-byte body
/// and counts how many body bytes the proxy has accepted from it so far.
pub async fn start_bulk_origin(len: u64) -> (SocketAddr, Arc<AtomicU64>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let written = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&written);

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = Vec::new();
        if read_head(&mut socket, &mut buf).await.is_none() {
            return;
        }
        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {len}\r\n\r\n");
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        let chunk = vec![b'x'; 64 * 1024];
        while counter.load(Ordering::SeqCst) < len {
            if socket.write_all(&chunk).await.is_err() {
                return;
            }
            counter.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        }
    });

    (addr, written)
}

/// Start an axum origin whose `/echo` route returns the `echo` header.
pub async fn start_axum_origin() -> SocketAddr {
    use axum::http::HeaderMap;
    use axum::routing::get;

    async fn echo(headers: HeaderMap) -> String {
        headers
            .get("echo")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = axum::Router::new().route("/echo", get(echo));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Build a proxy with default config and `hooks`, listening on an ephemeral
/// port.
pub async fn start_proxy(hooks: ProxyHooks) -> (Proxy, SocketAddr) {
    start_proxy_with(ProxyConfig::default(), hooks).await
}

pub async fn start_proxy_with(config: ProxyConfig, hooks: ProxyHooks) -> (Proxy, SocketAddr) {
    let proxy = Proxy::new(config, hooks).unwrap();
    let addr = proxy.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (proxy, addr)
}

/// A parsed response read by [`read_response`].
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one Content-Length framed response off `stream`.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> RawResponse {
    let mut buf = Vec::new();
    let head_end = read_head(stream, &mut buf).await.expect("response head");

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Response::new(&mut headers);
    parsed.parse(&buf[..head_end]).unwrap();
    let status = parsed.code.unwrap();
    let headers: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    let len = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map_or(0, |(_, v)| v.parse::<usize>().unwrap());
    let mut body = buf[head_end..].to_vec();
    while body.len() < len {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }

    RawResponse {
        status,
        headers,
        body,
    }
}

/// Poll `condition` for up to a second.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Open a raw client connection to the proxy.
pub async fn connect(proxy: SocketAddr) -> TcpStream {
    TcpStream::connect(proxy).await.unwrap()
}

/// Read until the end of a message head. Returns the head length, or `None`
/// when the peer closed first.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> Option<usize> {
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return Some(pos + 4);
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn serve_http<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
    let mut buf = Vec::new();
    loop {
        let Some(head_end) = read_head(&mut stream, &mut buf).await else {
            return;
        };

        let (target, echo, upgrade, len) = {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut request = httparse::Request::new(&mut headers);
            if request.parse(&buf[..head_end]).is_err() {
                return;
            }
            let find = |name: &str| {
                request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case(name))
                    .map(|h| String::from_utf8_lossy(h.value).into_owned())
            };
            (
                request.path.unwrap_or("/").to_string(),
                find("echo").unwrap_or_default(),
                find("upgrade").is_some(),
                find("content-length").map_or(0, |v| v.parse::<usize>().unwrap_or(0)),
            )
        };
        buf.drain(..head_end);

        if upgrade {
            let _ = stream
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
                )
                .await;
            if !buf.is_empty() && stream.write_all(&buf).await.is_err() {
                return;
            }
            let mut chunk = [0u8; 1024];
            while let Ok(n) = stream.read(&mut chunk).await {
                if n == 0 || stream.write_all(&chunk[..n]).await.is_err() {
                    break;
                }
            }
            let _ = stream.shutdown().await;
            return;
        }

        while buf.len() < len {
            let mut chunk = [0u8; 1024];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let body: Vec<u8> = buf.drain(..len).collect();

        let head = format!(
            "HTTP/1.1 200 OK\r\ntarget: {}\r\necho: {}\r\nContent-Length: {}\r\n\r\n",
            target,
            echo,
            body.len()
        );
        if stream.write_all(head.as_bytes()).await.is_err()
            || stream.write_all(&body).await.is_err()
        {
            return;
        }
    }
}
