//! Integration tests for the WebSocket relay server.
//!
//! These tests run a real RelayServer on a loopback port and talk to it with
//! a tokio-tungstenite client, covering upgrade negotiation, fan-out,
//! disconnect cleanup and graceful shutdown. Tests that need to observe the
//! connection task itself drive a single `ConnectionHandler` directly.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free policy applies
//! to production code only.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use wsrelay_core::{Payload, SubscriberId};
use wsrelayd::server::{ConnectionError, ConnectionHandler, Disconnect, MAX_INBOUND_MESSAGE_SIZE};
use wsrelayd::{Broadcaster, IngestError, IngestLoop, RelayServer, ServerSettings, SubscriberRegistry};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for a registry condition or a frame
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between registry checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn settings(max_subscribers: Option<usize>) -> ServerSettings {
    ServerSettings {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        path: "/ws".to_string(),
        max_subscribers,
        handshake_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(2),
    }
}

async fn wait_for_subscribers(registry: &SubscriberRegistry, count: usize) {
    let start = tokio::time::Instant::now();
    while registry.len() != count {
        assert!(
            start.elapsed() < WAIT_TIMEOUT,
            "expected {count} subscribers, have {}",
            registry.len()
        );
        sleep(POLL_INTERVAL).await;
    }
}

/// Test server context that manages server lifecycle.
struct TestServer {
    addr: SocketAddr,
    url_base: String,
    registry: SubscriberRegistry,
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(settings(None)).await
    }

    async fn spawn_with(settings: ServerSettings) -> Self {
        let registry = SubscriberRegistry::new();
        let cancel_token = CancellationToken::new();
        let server = RelayServer::bind(settings, registry.clone(), cancel_token.clone())
            .await
            .expect("bind loopback");
        let addr = server.local_addr().expect("local addr");

        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            url_base: format!("ws://{addr}"),
            registry,
            cancel_token,
            handle,
        }
    }

    fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(self.registry.clone(), Duration::from_secs(2))
    }

    /// Connects on the relay path and waits until the server registered it.
    async fn connect(&self) -> Client {
        let expected = self.registry.len() + 1;
        let (client, _response) = connect_async(format!("{}/ws", self.url_base))
            .await
            .expect("connect to relay");
        self.wait_for_subscribers(expected).await;
        client
    }

    async fn wait_for_subscribers(&self, count: usize) {
        wait_for_subscribers(&self.registry, count).await;
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("server stops in time")
            .expect("server task joins");
    }
}

/// A single connection served by a bare `ConnectionHandler`, so tests can
/// observe (or abort) the connection task itself.
struct SingleConnection {
    url: String,
    registry: SubscriberRegistry,
    handle: JoinHandle<Result<Disconnect, ConnectionError>>,
}

impl SingleConnection {
    async fn spawn(settings: ServerSettings) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let registry = SubscriberRegistry::new();

        let handler_registry = registry.clone();
        let settings = Arc::new(settings);
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.expect("accept");
            ConnectionHandler::new(
                stream,
                peer,
                SubscriberId::new(1),
                handler_registry,
                settings,
                CancellationToken::new(),
            )
            .run()
            .await
        });

        Self {
            url: format!("ws://{addr}/ws"),
            registry,
            handle,
        }
    }

    async fn connect(&self) -> Client {
        let (client, _response) = connect_async(self.url.as_str()).await.expect("connect to relay");
        wait_for_subscribers(&self.registry, 1).await;
        client
    }

    async fn finish(self) -> Result<Disconnect, ConnectionError> {
        timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("connection task ends in time")
            .expect("connection task joins")
    }
}

/// Reads the next data or close frame, skipping pings and pongs.
async fn next_frame(client: &mut Client) -> Option<Message> {
    loop {
        let frame = timeout(WAIT_TIMEOUT, client.next())
            .await
            .expect("frame within timeout");
        match frame {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(message)) => return Some(message),
            Some(Err(_)) | None => return None,
        }
    }
}

async fn next_text(client: &mut Client) -> String {
    match next_frame(client).await {
        Some(Message::Text(text)) => text.as_str().to_string(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Drains data frames until the connection closes.
async fn expect_closed(client: &mut Client) {
    loop {
        match next_frame(client).await {
            Some(Message::Close(_)) | None => return,
            Some(_) => continue,
        }
    }
}

fn http_status(result: Result<(Client, impl std::fmt::Debug), WsError>) -> u16 {
    match result {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("expected HTTP rejection, got {other}"),
        Ok(_) => panic!("expected HTTP rejection, upgrade succeeded"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let server = TestServer::spawn().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    let report = server.broadcaster().broadcast(Payload::from("hello")).await;
    assert_eq!(report.recipients, 2);
    assert_eq!(report.delivered, 2);

    assert_eq!(next_text(&mut a).await, "hello");
    assert_eq!(next_text(&mut b).await, "hello");

    server.shutdown().await;
}

#[tokio::test]
async fn test_non_utf8_payload_arrives_as_binary() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let bytes = Payload::from_static(&[0xde, 0xad, 0xbe, 0xef]);
    server.broadcaster().broadcast(bytes.clone()).await;

    match next_frame(&mut client).await {
        Some(Message::Binary(data)) => assert_eq!(data, bytes),
        other => panic!("expected binary frame, got {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_path_rejected_without_registration() {
    let server = TestServer::spawn().await;

    let status = http_status(connect_async(format!("{}/other", server.url_base)).await);
    assert_eq!(status, 404);
    assert!(server.registry.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_capacity_limit_rejects_extra_client() {
    let server = TestServer::spawn_with(settings(Some(1))).await;
    let _first = server.connect().await;

    let status = http_status(connect_async(format!("{}/ws", server.url_base)).await);
    assert_eq!(status, 503);
    assert_eq!(server.registry.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_close_deregisters() {
    let server = TestServer::spawn().await;
    let mut keep = server.connect().await;
    let mut leave = server.connect().await;

    leave.close(None).await.expect("send close");
    server.wait_for_subscribers(1).await;

    let report = server.broadcaster().broadcast(Payload::from("after")).await;
    assert_eq!(report.recipients, 1);
    assert_eq!(next_text(&mut keep).await, "after");

    server.shutdown().await;
}

#[tokio::test]
async fn test_dropped_connection_deregisters() {
    let server = TestServer::spawn().await;
    let client = server.connect().await;

    drop(client);
    server.wait_for_subscribers(0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_inbound_frames_are_ignored() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client
        .send(Message::text("ignored"))
        .await
        .expect("send inbound frame");
    sleep(POLL_INTERVAL * 5).await;
    assert_eq!(server.registry.len(), 1);

    server.broadcaster().broadcast(Payload::from("still here")).await;
    assert_eq!(next_text(&mut client).await, "still here");

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    let registry = server.registry.clone();

    server.shutdown().await;

    match next_frame(&mut client).await {
        Some(Message::Close(_)) | None => {}
        other => panic!("expected close, got {other:?}"),
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_ingest_end_to_end_preserves_order() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let (tx, rx) = mpsc::channel(8);
    for body in ["m1", "m2", "m3"] {
        tx.send(Payload::from(body)).await.unwrap();
    }
    drop(tx);

    let mut ingest = IngestLoop::new(rx, server.broadcaster(), CancellationToken::new());
    let result = ingest.run().await;
    assert!(matches!(result, Err(IngestError::SourceClosed { relayed: 3 })));

    assert_eq!(next_text(&mut client).await, "m1");
    assert_eq!(next_text(&mut client).await, "m2");
    assert_eq!(next_text(&mut client).await, "m3");

    server.shutdown().await;
}

#[tokio::test]
async fn test_late_subscriber_sees_only_later_messages() {
    let server = TestServer::spawn().await;
    let mut early = server.connect().await;
    let broadcaster = server.broadcaster();

    broadcaster.broadcast(Payload::from("before")).await;
    let mut late = server.connect().await;
    broadcaster.broadcast(Payload::from("after")).await;

    assert_eq!(next_text(&mut early).await, "before");
    assert_eq!(next_text(&mut early).await, "after");
    assert_eq!(next_text(&mut late).await, "after");

    server.shutdown().await;
}

#[tokio::test]
async fn test_aborted_connection_task_deregisters() {
    let conn = SingleConnection::spawn(settings(None)).await;
    let _client = conn.connect().await;
    assert_eq!(conn.registry.len(), 1);

    conn.handle.abort();
    let joined = timeout(WAIT_TIMEOUT, conn.handle)
        .await
        .expect("aborted task joins in time");
    assert!(joined.unwrap_err().is_cancelled());

    assert!(conn.registry.is_empty());
    let broadcaster = Broadcaster::new(conn.registry.clone(), Duration::from_secs(2));
    let report = broadcaster.broadcast(Payload::from("after abort")).await;
    assert_eq!(report.recipients, 0);
}

#[tokio::test]
async fn test_silent_client_dropped_after_handshake_timeout() {
    let mut quick = settings(None);
    quick.handshake_timeout = Duration::from_millis(200);
    let server = TestServer::spawn_with(quick).await;

    let mut stream = TcpStream::connect(server.addr).await.expect("tcp connect");
    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(1), stream.read(&mut buf))
        .await
        .expect("server hangs up within the deadline");
    assert!(matches!(read, Ok(0)), "expected EOF, got {read:?}");
    assert!(server.registry.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_stalled_client_evicted_and_connection_closed() {
    let mut quick = settings(None);
    quick.write_timeout = Duration::from_millis(200);
    let conn = SingleConnection::spawn(quick).await;
    // Never read until after eviction, so the socket buffers fill up.
    let mut client = conn.connect().await;

    let broadcaster = Broadcaster::new(conn.registry.clone(), Duration::from_millis(200));
    let large = Payload::from(vec![b'x'; 1024 * 1024]);
    let mut evicted = false;
    for _ in 0..64 {
        let report = broadcaster.broadcast(large.clone()).await;
        if report.failed == 1 {
            evicted = true;
            break;
        }
    }
    assert!(evicted, "stalled subscriber was never evicted");
    assert!(conn.registry.is_empty());

    let reason = conn.finish().await.expect("connection was registered");
    assert_eq!(reason, Disconnect::Evicted);

    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_oversized_inbound_frame_ends_connection() {
    let conn = SingleConnection::spawn(settings(None)).await;
    let mut client = conn.connect().await;

    let oversized = "y".repeat(MAX_INBOUND_MESSAGE_SIZE * 4);
    // The server may hang up mid-frame; only the outcome matters.
    let _ = client.send(Message::text(oversized)).await;

    let registry = conn.registry.clone();
    let reason = conn.finish().await.expect("connection was registered");
    assert!(matches!(reason, Disconnect::ReadError(_)), "got {reason:?}");
    assert!(registry.is_empty());
}
