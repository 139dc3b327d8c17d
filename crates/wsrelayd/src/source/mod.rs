//! Message sources feeding the ingestion loop.
//!
//! A source yields opaque payloads one at a time in delivery order.
//! `Ok(None)` means the stream has ended; the relay treats that, and any
//! error, as fatal. Reconnection is a source concern and not attempted here.

use async_trait::async_trait;
use tokio::sync::mpsc;

use wsrelay_core::Payload;

pub mod amqp;

pub use amqp::AmqpSource;

/// Sequential stream of payloads.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits for the next payload. `Ok(None)` signals exhaustion.
    async fn next_payload(&mut self) -> Result<Option<Payload>, SourceError>;

    /// Short label used in logs (queue name, channel name, ...).
    fn describe(&self) -> String;
}

/// Errors raised while connecting to or reading from a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Failed to create channel: {0}")]
    Channel(String),

    #[error("Failed to declare queue {queue}: {error}")]
    QueueDeclare { queue: String, error: String },

    #[error("Failed to subscribe to queue {queue}: {error}")]
    Subscribe { queue: String, error: String },

    #[error("Delivery error: {0}")]
    Delivery(String),
}

/// In-process source: payloads pushed into a tokio channel.
///
/// The stream ends once every sender has been dropped.
#[async_trait]
impl MessageSource for mpsc::Receiver<Payload> {
    async fn next_payload(&mut self) -> Result<Option<Payload>, SourceError> {
        Ok(self.recv().await)
    }

    fn describe(&self) -> String {
        "in-process channel".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_yields_in_order_then_ends() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Payload::from_static(b"a")).await.unwrap();
        tx.send(Payload::from_static(b"b")).await.unwrap();
        drop(tx);

        assert_eq!(rx.next_payload().await.unwrap(), Some(Payload::from_static(b"a")));
        assert_eq!(rx.next_payload().await.unwrap(), Some(Payload::from_static(b"b")));
        assert_eq!(rx.next_payload().await.unwrap(), None);
    }

    #[test]
    fn test_source_error_display() {
        let err = SourceError::QueueDeclare {
            queue: "events".to_string(),
            error: "access refused".to_string(),
        };
        assert!(err.to_string().contains("events"));
        assert!(err.to_string().contains("access refused"));
    }
}
