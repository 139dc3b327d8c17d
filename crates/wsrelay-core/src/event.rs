//! Structured logging vocabulary for relay lifecycle events.
//!
//! Every lifecycle event is emitted through `tracing` with an `event` field
//! (what happened) and a `status` field (how it went), plus identifiers such
//! as the peer label or payload size. Keeping the names here gives log
//! consumers a stable schema to filter on.

use std::fmt;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Configuration file loaded and validated
    ConfigLoad,

    /// Process starting or running
    ServiceStart,

    /// Process shutting down
    ServiceStop,

    /// Connection to the message broker
    RabbitmqConnection,

    /// Channel opened on the broker connection
    ChannelCreation,

    /// Durable queue declared
    QueueDeclare,

    /// Consumer started on the queue
    QueueSubscribe,

    /// WebSocket listener lifecycle
    WebsocketServer,

    /// WebSocket upgrade negotiation
    WebsocketUpgrade,

    /// Subscriber registered
    WebsocketConnection,

    /// Subscriber deregistered
    WebsocketDisconnection,

    /// Payload pulled from the queue
    MessageReceived,

    /// Payload delivered (or not) to one subscriber
    MessageBroadcast,

    /// Ingestion loop lifecycle
    Ingestion,
}

impl EventKind {
    /// Returns the snake_case name used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigLoad => "config_load",
            Self::ServiceStart => "service_start",
            Self::ServiceStop => "service_stop",
            Self::RabbitmqConnection => "rabbitmq_connection",
            Self::ChannelCreation => "channel_creation",
            Self::QueueDeclare => "queue_declare",
            Self::QueueSubscribe => "queue_subscribe",
            Self::WebsocketServer => "websocket_server",
            Self::WebsocketUpgrade => "websocket_upgrade",
            Self::WebsocketConnection => "websocket_connection",
            Self::WebsocketDisconnection => "websocket_disconnection",
            Self::MessageReceived => "message_received",
            Self::MessageBroadcast => "message_broadcast",
            Self::Ingestion => "ingestion",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Initializing,
    Started,
    Success,
    Failed,
    Rejected,
    Connected,
    Disconnected,
    Skipped,
    Stopped,
}

impl EventStatus {
    /// Returns the snake_case name used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Started => "started",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Skipped => "skipped",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
