//! WebSocket server for the relay.
//!
//! The server:
//! - Listens on a TCP socket for subscriber connections
//! - Spawns a ConnectionHandler for each client
//! - Shares one SubscriberRegistry with the broadcaster
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌────────────────────┐
//! │ConnectionHandler│────▶│ SubscriberRegistry │◀──── Broadcaster
//! │   (per client)  │     │                    │
//! └─────────────────┘     └────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{
    frame_for, ConnectionError, ConnectionHandler, Disconnect, WebSocketSink,
    MAX_INBOUND_MESSAGE_SIZE,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use wsrelay_core::{ConfigError, EventKind, EventStatus, ServerConfig, SubscriberId};

use crate::registry::SubscriberRegistry;

/// Resolved settings for the acceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Address to bind
    pub listen_addr: SocketAddr,

    /// Request path subscribers must upgrade on
    pub path: String,

    /// Upper bound on concurrent subscribers
    pub max_subscribers: Option<usize>,

    /// Deadline for the upgrade handshake
    pub handshake_timeout: Duration,

    /// Deadline for closing a subscriber's connection
    pub write_timeout: Duration,
}

impl ServerSettings {
    /// Builds settings from the `[server]` config section.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            listen_addr: config.listen_addr()?,
            path: config.path.clone(),
            max_subscribers: config.max_subscribers,
            handshake_timeout: config.handshake_timeout(),
            write_timeout: config.write_timeout(),
        })
    }
}

/// WebSocket server that turns accepted connections into subscribers.
pub struct RelayServer {
    /// Bound listener
    listener: TcpListener,

    /// Acceptor settings, shared with every connection task
    settings: Arc<ServerSettings>,

    /// Registry the connections are added to
    registry: SubscriberRegistry,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Source of subscriber ids
    connection_counter: AtomicU64,
}

impl RelayServer {
    /// Binds the listener.
    ///
    /// Binding happens up front so a bad address or a taken port is
    /// reported at startup, before any message is consumed.
    pub async fn bind(
        settings: ServerSettings,
        registry: SubscriberRegistry,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(settings.listen_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: settings.listen_addr,
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            settings: Arc::new(settings),
            registry,
            cancel_token,
            connection_counter: AtomicU64::new(1),
        })
    }

    /// Returns the bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::LocalAddr(e.to_string()))
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Runs the accept loop until the cancellation token is triggered.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(
            event = %EventKind::WebsocketServer,
            status = %EventStatus::Started,
            addr = %addr,
            port = addr.port(),
            path = %self.settings.path,
            "WebSocket server started"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Spawns a handler task for one accepted connection.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = SubscriberId::new(self.connection_counter.fetch_add(1, Ordering::Relaxed));
        let handler = ConnectionHandler::new(
            stream,
            peer,
            id,
            self.registry.clone(),
            Arc::clone(&self.settings),
            self.cancel_token.child_token(),
        );

        tokio::spawn(async move {
            match handler.run().await {
                Ok(reason) => debug!(subscriber_id = %id, ?reason, "Connection task finished"),
                Err(e) => debug!(client = %peer, error = %e, "Connection rejected"),
            }
        });
    }

    /// Closes every remaining subscriber.
    async fn cleanup(&self) {
        let remaining = self.registry.drain();
        let count = remaining.len();
        for subscriber in remaining {
            if tokio::time::timeout(self.settings.write_timeout, subscriber.close())
                .await
                .is_err()
            {
                debug!(subscriber_id = %subscriber.id(), "Close timed out during shutdown");
            }
        }

        info!(
            event = %EventKind::WebsocketServer,
            status = %EventStatus::Stopped,
            closed = count,
            "Server cleanup complete"
        );
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Failed to read local address: {0}")]
    LocalAddr(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_default_config() {
        let settings = ServerSettings::from_config(&ServerConfig::default()).unwrap();
        assert_eq!(settings.path, "/ws");
        assert_eq!(settings.listen_addr.port(), 8080);
        assert_eq!(settings.write_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_subscribers, None);
    }

    #[test]
    fn test_settings_reject_bad_bind() {
        let config = ServerConfig {
            bind: "not-an-ip".to_string(),
            ..ServerConfig::default()
        };
        assert!(ServerSettings::from_config(&config).is_err());
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            error: "address in use".to_string(),
        };
        assert!(err.to_string().contains("127.0.0.1:8080"));
        assert!(err.to_string().contains("address in use"));
    }

    #[tokio::test]
    async fn test_bind_port_zero_reports_real_port() {
        let config = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let settings = ServerSettings::from_config(&config).unwrap();
        let server = RelayServer::bind(settings, SubscriberRegistry::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
