//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use endpoint_kit::transport::http;
use endpoint_kit::{Endpoint, Error, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Read one HTTP/1.1 request (headers plus `Content-Length` body).
async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let content_length = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < end + 4 + content_length {
                let n = socket.read(&mut chunk).await.ok()?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            return Some(String::from_utf8_lossy(&buf[end + 4..]).to_string());
        }
    }
}

/// Start a programmable mock backend. `f` receives the request body and
/// returns the status code and body to answer with.
pub async fn start_programmable_backend<F, Fut>(addr: SocketAddr, f: F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await.unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let Some(body) = read_request(&mut socket).await else {
                            return;
                        };
                        let (status, body) = f(body).await;
                        let status_text = match status {
                            200 => "200 OK",
                            400 => "400 Bad Request",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response_str = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
}

/// A mock backend answering every request with a fixed status and body,
/// counting hits into `hits`.
pub async fn start_counting_backend(addr: SocketAddr, status: u16, body: &'static str, hits: Arc<AtomicU32>) {
    start_programmable_backend(addr, move |_req| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            (status, body.to_string())
        }
    })
    .await;
}

/// Serve `router` through the HTTP binding on `addr`.
pub async fn start_binding(addr: SocketAddr, router: Router, shutdown: &Shutdown) {
    let listener = TcpListener::bind(addr).await.unwrap();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = http::serve(listener, router, &shutdown).await;
    });
}

/// Uppercasing endpoint that counts invocations.
pub fn uppercase(calls: Arc<AtomicU32>) -> Endpoint<String, String> {
    Endpoint::new(move |_ctx, s: String| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if s.is_empty() {
                Err(Error::transport("empty input"))
            } else {
                Ok(s.to_uppercase())
            }
        }
    })
}

/// Test HTTP client that never reuses connections.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
