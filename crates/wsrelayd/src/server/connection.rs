//! Connection handler for individual WebSocket subscribers.
//!
//! Each accepted TCP connection gets its own `ConnectionHandler` that:
//! - Negotiates the WebSocket upgrade (path check, capacity check, deadline)
//! - Registers a [`Subscriber`] wrapping the write half
//! - Reads from the peer only to notice close or transport errors
//! - Deregisters and closes the subscriber on every exit path
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wsrelay_core::{EventKind, EventStatus, Payload, SubscriberId};

use super::ServerSettings;
use crate::registry::SubscriberRegistry;
use crate::subscriber::{FrameSink, SinkError, Subscriber};

type WsStream = WebSocketStream<TcpStream>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Largest inbound frame or message a subscriber may send. The channel is
/// push-only, so anything bigger ends the connection with a read error.
pub const MAX_INBOUND_MESSAGE_SIZE: usize = 64 * 1024;

/// Write half of a WebSocket connection, exposed as a [`FrameSink`].
///
/// Writes are serialized by a per-connection mutex; the registry lock is
/// never involved.
pub struct WebSocketSink {
    writer: Mutex<WsWriter>,
}

impl WebSocketSink {
    fn new(writer: WsWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_frame(&self, payload: Payload) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(frame_for(payload))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        // Sends a close frame if one has not gone out yet, then flushes.
        if let Err(e) = writer.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

/// Text frame for UTF-8 payloads, binary frame for anything else.
pub fn frame_for(payload: Payload) -> Message {
    match Utf8Bytes::try_from(payload.clone()) {
        Ok(text) => Message::Text(text),
        Err(_) => Message::Binary(payload),
    }
}

/// Why a registered connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer sent a close frame or the stream ended
    PeerClosed,

    /// Broadcaster closed the subscriber after a failed write
    Evicted,

    /// Server is shutting down
    Shutdown,

    /// Read side failed
    ReadError(String),
}

impl Disconnect {
    fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Evicted => "write_failed",
            Self::Shutdown => "shutdown",
            Self::ReadError(_) => "read_error",
        }
    }
}

/// Errors that prevent a connection from ever being registered.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,

    #[error("WebSocket upgrade rejected with HTTP {0}")]
    Rejected(StatusCode),
}

impl ConnectionError {
    /// Status reported in the `websocket_upgrade` log record.
    pub fn status(&self) -> EventStatus {
        match self {
            Self::Rejected(_) => EventStatus::Rejected,
            Self::Handshake(_) | Self::HandshakeTimeout => EventStatus::Failed,
        }
    }
}

/// Deregisters and marks the subscriber closed when dropped.
///
/// Covers early returns, task cancellation and panics; the normal path
/// performs the same steps explicitly first, so the drop is then a no-op.
struct Registration {
    registry: SubscriberRegistry,
    subscriber: Subscriber,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.subscriber.id());
        self.subscriber.mark_closed();
    }
}

/// Handler for a single subscriber connection.
pub struct ConnectionHandler {
    stream: TcpStream,
    peer: SocketAddr,
    id: SubscriberId,
    registry: SubscriberRegistry,
    settings: Arc<ServerSettings>,
    cancel_token: CancellationToken,
}

impl ConnectionHandler {
    /// Creates a handler for a freshly accepted TCP connection.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        id: SubscriberId,
        registry: SubscriberRegistry,
        settings: Arc<ServerSettings>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            stream,
            peer,
            id,
            registry,
            settings,
            cancel_token,
        }
    }

    /// Runs the connection to completion.
    ///
    /// Returns an error only when negotiation fails; in that case the
    /// registry was never touched. Otherwise returns why the registered
    /// connection ended.
    pub async fn run(self) -> Result<Disconnect, ConnectionError> {
        let Self {
            stream,
            peer,
            id,
            registry,
            settings,
            cancel_token,
        } = self;
        let client = peer.to_string();

        let ws = match negotiate(stream, &registry, &settings).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(
                    event = %EventKind::WebsocketUpgrade,
                    status = %e.status(),
                    client = %client,
                    error = %e,
                    "Failed to upgrade connection"
                );
                return Err(e);
            }
        };

        let (writer, reader) = ws.split();
        let subscriber = Subscriber::new(id, client.clone(), WebSocketSink::new(writer));
        registry.register(subscriber.clone());
        let registration = Registration {
            registry,
            subscriber,
        };

        info!(
            event = %EventKind::WebsocketConnection,
            status = %EventStatus::Connected,
            subscriber_id = %id,
            client = %client,
            subscribers = registration.registry.len(),
            "New WebSocket client connected"
        );

        let reason = watch_peer(reader, &registration.subscriber, &cancel_token).await;

        registration.registry.deregister(id);
        if timeout(settings.write_timeout, registration.subscriber.close())
            .await
            .is_err()
        {
            debug!(subscriber_id = %id, "Close timed out, dropping connection");
        }

        info!(
            event = %EventKind::WebsocketDisconnection,
            status = %EventStatus::Disconnected,
            subscriber_id = %id,
            client = %client,
            reason = reason.as_str(),
            "WebSocket client disconnected"
        );

        drop(registration);
        Ok(reason)
    }
}

/// Performs the upgrade, rejecting wrong paths and over-capacity requests.
async fn negotiate(
    stream: TcpStream,
    registry: &SubscriberRegistry,
    settings: &ServerSettings,
) -> Result<WsStream, ConnectionError> {
    let expected_path = settings.path.clone();
    let max_subscribers = settings.max_subscribers;
    let registry = registry.clone();

    let callback = move |request: &Request, response: Response| {
        if request.uri().path() != expected_path {
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        if max_subscribers.is_some_and(|max| registry.len() >= max) {
            return Err(reject(
                StatusCode::SERVICE_UNAVAILABLE,
                "too many subscribers",
            ));
        }
        Ok(response)
    };

    let upgrade = accept_hdr_async_with_config(stream, callback, Some(inbound_limits()));
    match timeout(settings.handshake_timeout, upgrade).await {
        Ok(Ok(ws)) => Ok(ws),
        Ok(Err(WsError::Http(response))) => Err(ConnectionError::Rejected(response.status())),
        Ok(Err(e)) => Err(ConnectionError::Handshake(e.to_string())),
        Err(_) => Err(ConnectionError::HandshakeTimeout),
    }
}

fn inbound_limits() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_INBOUND_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_INBOUND_MESSAGE_SIZE))
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Blocks until the peer goes away, the subscriber is closed elsewhere, or
/// shutdown. Inbound data frames are discarded: the channel is push-only.
async fn watch_peer(
    mut reader: WsReader,
    subscriber: &Subscriber,
    cancel_token: &CancellationToken,
) -> Disconnect {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return Disconnect::Shutdown,

            _ = subscriber.closed() => return Disconnect::Evicted,

            frame = reader.next() => match frame {
                None | Some(Ok(Message::Close(_))) => return Disconnect::PeerClosed,
                Some(Ok(_)) => {
                    debug!(subscriber_id = %subscriber.id(), "Ignoring inbound frame");
                }
                Some(Err(e)) => return Disconnect::ReadError(e.to_string()),
            },
        }
    }
}
