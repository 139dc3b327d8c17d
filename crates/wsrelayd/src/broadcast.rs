//! Fan-out of one payload to every registered subscriber.
//!
//! Each pass works on a registry snapshot taken under the lock; writes happen
//! after the lock is released. Deliveries run concurrently and each is
//! bounded by the write timeout, so one hung or broken subscriber cannot hold
//! up the others. A subscriber whose delivery fails is deregistered and then
//! closed; the rest of the pass continues unaffected.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use wsrelay_core::{EventKind, EventStatus, Payload};

use crate::registry::SubscriberRegistry;
use crate::subscriber::{SinkError, Subscriber};

/// Default per-subscriber write deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome counts for one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers in the snapshot
    pub recipients: usize,

    /// Deliveries that completed
    pub delivered: usize,

    /// Deliveries that failed (those subscribers were removed)
    pub failed: usize,
}

/// Why a single delivery failed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Subscriber already closed")]
    Closed,

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Write failed: {0}")]
    Sink(SinkError),
}

/// Delivers payloads to the members of a [`SubscriberRegistry`].
#[derive(Clone)]
pub struct Broadcaster {
    registry: SubscriberRegistry,
    write_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: SubscriberRegistry, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Delivers `payload` to every current subscriber.
    ///
    /// Returns once every delivery has completed, failed, or timed out.
    /// Failures are contained: they are logged, the subscriber is removed,
    /// and the caller only sees them in the report counts.
    pub async fn broadcast(&self, payload: Payload) -> BroadcastReport {
        let members = self.registry.snapshot();
        let payload_size = payload.len();

        if members.is_empty() {
            debug!(
                event = %EventKind::MessageBroadcast,
                status = %EventStatus::Skipped,
                payload_size,
                "No subscribers connected"
            );
            return BroadcastReport::default();
        }

        let outcomes = join_all(
            members
                .iter()
                .map(|sub| self.deliver_and_settle(sub, payload.clone())),
        )
        .await;

        let delivered = outcomes.iter().filter(|ok| **ok).count();
        let report = BroadcastReport {
            recipients: members.len(),
            delivered,
            failed: members.len() - delivered,
        };

        debug!(
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed,
            payload_size,
            "Broadcast pass complete"
        );

        report
    }

    /// Delivers to one subscriber and evicts it on failure.
    async fn deliver_and_settle(&self, sub: &Subscriber, payload: Payload) -> bool {
        let payload_size = payload.len();

        match self.deliver(sub, payload).await {
            Ok(()) => {
                debug!(
                    event = %EventKind::MessageBroadcast,
                    status = %EventStatus::Success,
                    subscriber_id = %sub.id(),
                    client = %sub.peer(),
                    payload_size,
                    "Message sent to subscriber"
                );
                true
            }
            Err(e) => {
                warn!(
                    event = %EventKind::MessageBroadcast,
                    status = %EventStatus::Failed,
                    subscriber_id = %sub.id(),
                    client = %sub.peer(),
                    payload_size,
                    error = %e,
                    "Failed to send message to subscriber"
                );
                self.evict(sub).await;
                false
            }
        }
    }

    async fn deliver(&self, sub: &Subscriber, payload: Payload) -> Result<(), DeliveryError> {
        if sub.is_closed() {
            return Err(DeliveryError::Closed);
        }

        match timeout(self.write_timeout, sub.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(SinkError::Closed)) => Err(DeliveryError::Closed),
            Ok(Err(e)) => Err(DeliveryError::Sink(e)),
            Err(_) => Err(DeliveryError::Timeout(self.write_timeout)),
        }
    }

    /// Removes a failed subscriber from the registry, then closes it.
    async fn evict(&self, sub: &Subscriber) {
        if self.registry.deregister(sub.id()) {
            info!(
                event = %EventKind::WebsocketDisconnection,
                status = %EventStatus::Disconnected,
                subscriber_id = %sub.id(),
                client = %sub.peer(),
                reason = "write_failed",
                "Removed subscriber after failed write"
            );
        }

        if timeout(self.write_timeout, sub.close()).await.is_err() {
            debug!(subscriber_id = %sub.id(), "Close timed out, dropping connection");
        }
    }
}
