//! Ingestion loop: source -> broadcaster, one payload at a time.
//!
//! Each payload is fully fanned out before the next one is pulled, which
//! preserves source order for every subscriber that stays connected.
//! Exhaustion or failure of the source ends the loop with an error; the
//! daemon treats that as fatal. Cancellation ends it cleanly.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wsrelay_core::{EventKind, EventStatus};

use crate::broadcast::Broadcaster;
use crate::source::{MessageSource, SourceError};

/// Errors that end the ingestion loop.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Message source closed after {relayed} messages")]
    SourceClosed { relayed: u64 },

    #[error("Message source failed after {relayed} messages: {error}")]
    Source {
        relayed: u64,
        #[source]
        error: SourceError,
    },
}

/// Pulls from a [`MessageSource`] and hands each payload to a [`Broadcaster`].
pub struct IngestLoop<S> {
    source: S,
    broadcaster: Broadcaster,
    cancel_token: CancellationToken,
}

impl<S: MessageSource> IngestLoop<S> {
    pub fn new(source: S, broadcaster: Broadcaster, cancel_token: CancellationToken) -> Self {
        Self {
            source,
            broadcaster,
            cancel_token,
        }
    }

    /// Gives the source back, e.g. to close it after the loop ends.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Runs until the source ends, the source fails, or cancellation.
    ///
    /// Returns the number of payloads relayed when cancelled. Cancellation is
    /// only observed between payloads; an in-flight broadcast always
    /// completes.
    pub async fn run(&mut self) -> Result<u64, IngestError> {
        let label = self.source.describe();
        let mut relayed: u64 = 0;

        info!(
            event = %EventKind::Ingestion,
            status = %EventStatus::Started,
            source = %label,
            "Ingestion loop started"
        );

        loop {
            let next = tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    info!(
                        event = %EventKind::Ingestion,
                        status = %EventStatus::Stopped,
                        relayed,
                        "Ingestion loop cancelled"
                    );
                    return Ok(relayed);
                }

                next = self.source.next_payload() => next,
            };

            let payload = match next {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    warn!(
                        event = %EventKind::Ingestion,
                        status = %EventStatus::Stopped,
                        source = %label,
                        relayed,
                        "Message source closed"
                    );
                    return Err(IngestError::SourceClosed { relayed });
                }
                Err(e) => {
                    error!(
                        event = %EventKind::Ingestion,
                        status = %EventStatus::Failed,
                        source = %label,
                        relayed,
                        error = %e,
                        "Message source failed"
                    );
                    return Err(IngestError::Source { relayed, error: e });
                }
            };

            info!(
                event = %EventKind::MessageReceived,
                status = %EventStatus::Success,
                source = %label,
                payload_size = payload.len(),
                "Received message"
            );

            self.broadcaster.broadcast(payload).await;
            relayed += 1;
        }
    }
}
