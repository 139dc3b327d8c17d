//! Subscriber handles.
//!
//! A [`Subscriber`] wraps one live downstream connection behind the
//! [`FrameSink`] trait so the registry and broadcaster never depend on the
//! transport. The WebSocket implementation lives in `server::connection`;
//! tests plug in in-memory sinks.
//!
//! # Lifecycle
//!
//! ```text
//! created ──▶ registered ──▶ active ──▶ deregistered ──▶ closed
//! ```
//!
//! The closed flag is set before the transport is told to close, and every
//! send checks it first, so a subscriber never receives a frame after close.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wsrelay_core::{Payload, SubscriberId};

/// Transport-side half of a subscriber: something that can carry one
/// discrete message frame and can be closed.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Writes one payload as a single frame.
    async fn send_frame(&self, payload: Payload) -> Result<(), SinkError>;

    /// Releases the underlying connection. Must tolerate repeated calls.
    async fn close(&self);
}

/// Errors surfaced by a [`FrameSink`].
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Subscriber is closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Cheap-to-clone handle to one live downstream connection.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    id: SubscriberId,
    peer: String,
    sink: Box<dyn FrameSink>,
    closed: AtomicBool,
    closed_signal: CancellationToken,
}

impl Subscriber {
    /// Creates a subscriber around a freshly negotiated connection.
    pub fn new(id: SubscriberId, peer: impl Into<String>, sink: impl FrameSink + 'static) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                id,
                peer: peer.into(),
                sink: Box::new(sink),
                closed: AtomicBool::new(false),
                closed_signal: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// Peer label (remote address), for logging only.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Sends one payload, refusing if the subscriber has been closed.
    pub async fn send(&self, payload: Payload) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.inner.sink.send_frame(payload).await
    }

    /// Marks the subscriber closed without touching the transport.
    ///
    /// Returns true if this call performed the transition.
    pub fn mark_closed(&self) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::AcqRel);
        self.inner.closed_signal.cancel();
        first
    }

    /// Resolves once the subscriber has been marked closed by any party.
    pub async fn closed(&self) {
        self.inner.closed_signal.cancelled().await;
    }

    /// Marks the subscriber closed and releases the transport.
    ///
    /// Only the first caller reaches the sink; later calls are no-ops, so the
    /// read path and the write path can both call this safely.
    pub async fn close(&self) {
        if self.mark_closed() {
            debug!(subscriber_id = %self.id(), client = %self.peer(), "Closing subscriber");
            self.inner.sink.close().await;
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
