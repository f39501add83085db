//! Integration tests for Mirage Tunnel
//!
//! These run a real relay over plain HTTP with an echo service as the
//! downstream, and drive it both with raw HTTP requests and with the
//! client's copy loop.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

use mirage_tunnel::relay::{CoverConfig, Relay, SessionTable};
use mirage_tunnel::transport::NativeRoundTripper;
use mirage_tunnel::tunnel::{copy_loop, gen_session_id, RequestInfo};

/// Echo service that counts accepted connections.
async fn spawn_echo() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1 << 16];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, connections)
}

/// Serve `relay` over plain HTTP on an ephemeral port.
async fn serve_relay(relay: Arc<Relay>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let relay = relay.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let relay = relay.clone();
                    async move { Ok::<_, Infallible>(relay.handle(request).await) }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

struct TestRelay {
    addr: SocketAddr,
    sessions: Arc<SessionTable>,
    echo_connections: Arc<AtomicUsize>,
}

impl TestRelay {
    fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

/// Relay with an echo downstream, default cover, and a configurable
/// staleness horizon.
async fn start_test_relay(staleness: Duration) -> TestRelay {
    let (echo_addr, echo_connections) = spawn_echo().await;
    let sessions = Arc::new(SessionTable::with_staleness(
        echo_addr.to_string(),
        staleness,
    ));
    let cover = CoverConfig::new(Some("/nonexistent/index.html".into()), None).unwrap();
    let relay = Arc::new(Relay::new(sessions.clone(), cover));
    let addr = serve_relay(relay).await;
    TestRelay {
        addr,
        sessions,
        echo_connections,
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}

/// Issue one tunnel POST and return (status, content-type, body).
async fn post(
    client: &reqwest::Client,
    url: &str,
    session_id: &str,
    body: Vec<u8>,
) -> (u16, String, Vec<u8>) {
    let mut request = client
        .post(url)
        .header("Content-Type", "application/octet-stream")
        .header("X-Session-Id", session_id);
    if !body.is_empty() {
        request = request.body(body);
    }
    let response = request.send().await.unwrap();
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get("Content-Type")
        .map(|value| value.to_str().unwrap().to_string())
        .unwrap_or_default();
    let body = response.bytes().await.unwrap().to_vec();
    (status, content_type, body)
}

/// Poll until `want` bytes have come back through the session.
async fn poll_until(
    client: &reqwest::Client,
    url: &str,
    session_id: &str,
    mut collected: Vec<u8>,
    want: usize,
) -> Vec<u8> {
    for _ in 0..50 {
        if collected.len() >= want {
            break;
        }
        let (status, _, body) = post(client, url, session_id, Vec::new()).await;
        assert_eq!(status, 200);
        collected.extend_from_slice(&body);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    collected
}

#[tokio::test]
async fn test_basic_echo() {
    let relay = start_test_relay(Duration::from_secs(120)).await;
    let client = http_client();

    let (status, content_type, body) =
        post(&client, &relay.url(), "AAAAAAAA", b"ping".to_vec()).await;
    assert_eq!(status, 200);
    assert_eq!(content_type, "application/octet-stream");

    // The echo may straddle the 10 ms turnaround; keep polling.
    let collected = poll_until(&client, &relay.url(), "AAAAAAAA", body, 4).await;
    assert_eq!(&collected, b"ping");
}

#[tokio::test]
async fn test_short_session_id() {
    let relay = start_test_relay(Duration::from_secs(120)).await;
    let client = http_client();

    let (status, _, _) = post(&client, &relay.url(), "short", b"ping".to_vec()).await;
    assert_eq!(status, 400);
    assert!(relay.sessions.is_empty().await);
}

#[tokio::test]
async fn test_missing_session_id() {
    let relay = start_test_relay(Duration::from_secs(120)).await;
    let client = http_client();

    let response = client
        .post(relay.url())
        .body(b"ping".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn test_oversize_body() {
    let relay = start_test_relay(Duration::from_secs(120)).await;
    let client = http_client();

    let oversize = vec![0u8; mirage_tunnel::MAX_PAYLOAD_LENGTH + 1];
    let (status, _, _) = post(&client, &relay.url(), "AAAAAAAA", oversize).await;
    assert!((400..500).contains(&status), "expected 4xx, got {}", status);
    assert!(relay.sessions.is_empty().await);

    // A payload exactly at the cap is fine.
    let exact = vec![7u8; mirage_tunnel::MAX_PAYLOAD_LENGTH];
    let (status, _, _) = post(&client, &relay.url(), "AAAAAAAA", exact).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_cover_page_mask() {
    let dir = std::env::temp_dir().join("mirage-mask-test");
    std::fs::create_dir_all(&dir).unwrap();
    let mask = dir.join("mask.html");
    std::fs::write(&mask, "<html>x</html>").unwrap();

    let (echo_addr, _) = spawn_echo().await;
    let sessions = Arc::new(SessionTable::new(echo_addr.to_string()));
    let cover = CoverConfig::new(Some(mask), None).unwrap();
    let addr = serve_relay(Arc::new(Relay::new(sessions, cover))).await;

    let response = http_client()
        .get(format!("http://{}/", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("Content-Type").unwrap(),
        "text/html; charset=utf-8"
    );
    assert_eq!(response.text().await.unwrap(), "<html>x</html>");
}

#[tokio::test]
async fn test_cover_page_fallback() {
    let relay = start_test_relay(Duration::from_secs(120)).await;

    let response = http_client().get(relay.url()).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("Content-Type").unwrap(),
        "text/plain; charset=utf-8"
    );
    let body = response.text().await.unwrap();
    assert!(!body.is_empty());
    assert!(!body.contains('<'));
}

#[tokio::test]
async fn test_cover_redirect() {
    let (echo_addr, _) = spawn_echo().await;
    let sessions = Arc::new(SessionTable::new(echo_addr.to_string()));
    let cover = CoverConfig::new(None, Some("https://example.org/")).unwrap();
    let addr = serve_relay(Arc::new(Relay::new(sessions, cover))).await;

    let response = http_client()
        .get(format!("http://{}/", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 301);
    assert_eq!(
        response.headers().get("Location").unwrap(),
        "https://example.org/"
    );
}

#[tokio::test]
async fn test_get_of_other_paths_is_not_found() {
    let relay = start_test_relay(Duration::from_secs(120)).await;

    let response = http_client()
        .get(format!("http://{}/robots.txt", relay.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_other_methods_are_rejected() {
    let relay = start_test_relay(Duration::from_secs(120)).await;
    let client = http_client();

    for method in [reqwest::Method::PUT, reqwest::Method::DELETE] {
        let response = client
            .request(method.clone(), relay.url())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400, "method {}", method);
    }
}

#[tokio::test]
async fn test_idle_expiry_opens_fresh_downstream() {
    let relay = start_test_relay(Duration::from_millis(100)).await;
    let client = http_client();

    let (status, _, _) = post(&client, &relay.url(), "BBBBBBBB", b"x".to_vec()).await;
    assert_eq!(status, 200);
    assert_eq!(relay.echo_connections.load(Ordering::SeqCst), 1);
    assert!(relay.sessions.contains("BBBBBBBB").await);

    // Let the session go stale, then sweep it the way the expiry loop
    // would.
    tokio::time::sleep(Duration::from_millis(150)).await;
    relay.sessions.sweep().await;
    assert!(!relay.sessions.contains("BBBBBBBB").await);

    // The same id now dials a fresh downstream connection.
    let (status, _, _) = post(&client, &relay.url(), "BBBBBBBB", b"y".to_vec()).await;
    assert_eq!(status, 200);
    assert_eq!(relay.echo_connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let relay = start_test_relay(Duration::from_secs(120)).await;
    let client = http_client();

    let (status, _, body_a) = post(&client, &relay.url(), "AAAAAAAA", b"aaaa".to_vec()).await;
    assert_eq!(status, 200);
    let (status, _, body_b) = post(&client, &relay.url(), "BBBBBBBB", b"bbbb".to_vec()).await;
    assert_eq!(status, 200);

    let collected_a = poll_until(&client, &relay.url(), "AAAAAAAA", body_a, 4).await;
    let collected_b = poll_until(&client, &relay.url(), "BBBBBBBB", body_b, 4).await;
    assert_eq!(&collected_a, b"aaaa");
    assert_eq!(&collected_b, b"bbbb");
    assert_eq!(relay.sessions.len().await, 2);
}

#[tokio::test]
async fn test_copy_loop_through_real_relay() {
    let relay = start_test_relay(Duration::from_secs(120)).await;

    let info = RequestInfo {
        session_id: gen_session_id(),
        url: Url::parse(&relay.url()).unwrap(),
        host: None,
        round_tripper: Arc::new(NativeRoundTripper::new(None).unwrap()),
    };

    let (mut app, tunnel_side) = tokio::io::duplex(1 << 16);
    let loop_task = tokio::spawn(copy_loop(tunnel_side, info));

    app.write_all(b"hello tunnel").await.unwrap();
    let mut reply = [0u8; 12];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello tunnel");

    // A second exchange on the same session.
    app.write_all(b"again").await.unwrap();
    let mut reply = [0u8; 5];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"again");

    app.shutdown().await.unwrap();
    loop_task.await.unwrap().unwrap();
    assert_eq!(relay.echo_connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fronted_request_carries_covert_host() {
    // The relay plays the part of the CDN edge: the client connects to it
    // by address while the Host header names the covert origin. The relay
    // ignores Host, so the tunnel works regardless.
    let relay = start_test_relay(Duration::from_secs(120)).await;

    let info = RequestInfo {
        session_id: gen_session_id(),
        url: Url::parse(&relay.url()).unwrap(),
        host: Some("forbidden.example".to_string()),
        round_tripper: Arc::new(NativeRoundTripper::new(None).unwrap()),
    };

    let (mut app, tunnel_side) = tokio::io::duplex(1 << 16);
    let loop_task = tokio::spawn(copy_loop(tunnel_side, info));

    app.write_all(b"fronted").await.unwrap();
    let mut reply = [0u8; 7];
    app.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"fronted");

    app.shutdown().await.unwrap();
    loop_task.await.unwrap().unwrap();
}
