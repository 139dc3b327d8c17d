//! AMQP queue consumer.
//!
//! Connects to the broker, declares the configured queue and consumes it
//! with automatic acknowledgement: the relay is a live tail, so a payload is
//! considered handled as soon as it has been pulled.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, error, info};

use wsrelay_core::{BrokerConfig, EventKind, EventStatus, Payload};

use super::{MessageSource, SourceError};

/// Reply code sent with a normal connection close.
const REPLY_SUCCESS: u16 = 200;

/// Payload source backed by a `lapin` consumer.
pub struct AmqpSource {
    queue: String,
    consumer: Consumer,
    channel: Channel,
    connection: Connection,
}

impl AmqpSource {
    /// Connects, opens a channel, declares the queue and starts consuming.
    ///
    /// Every step is logged; the first failure is returned and nothing is
    /// retried.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, SourceError> {
        let broker = redact_url(&config.url);

        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                error!(
                    event = %EventKind::RabbitmqConnection,
                    status = %EventStatus::Failed,
                    broker = %broker,
                    error = %e,
                    "Failed to connect to RabbitMQ"
                );
                SourceError::Connect(e.to_string())
            })?;
        info!(
            event = %EventKind::RabbitmqConnection,
            status = %EventStatus::Success,
            broker = %broker,
            "Connected to RabbitMQ"
        );

        let channel = connection.create_channel().await.map_err(|e| {
            error!(
                event = %EventKind::ChannelCreation,
                status = %EventStatus::Failed,
                error = %e,
                "Failed to create RabbitMQ channel"
            );
            SourceError::Channel(e.to_string())
        })?;

        if let Some(prefetch) = config.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| SourceError::Channel(e.to_string()))?;
            debug!(prefetch, "Applied consumer prefetch");
        }

        let declare_options = QueueDeclareOptions {
            durable: config.durable,
            ..QueueDeclareOptions::default()
        };
        channel
            .queue_declare(&config.queue, declare_options, FieldTable::default())
            .await
            .map_err(|e| {
                error!(
                    event = %EventKind::QueueDeclare,
                    status = %EventStatus::Failed,
                    queue = %config.queue,
                    error = %e,
                    "Failed to declare queue"
                );
                SourceError::QueueDeclare {
                    queue: config.queue.clone(),
                    error: e.to_string(),
                }
            })?;

        let consume_options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let consumer = channel
            .basic_consume(
                &config.queue,
                &config.consumer_tag,
                consume_options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(
                    event = %EventKind::QueueSubscribe,
                    status = %EventStatus::Failed,
                    queue = %config.queue,
                    error = %e,
                    "Failed to subscribe to queue"
                );
                SourceError::Subscribe {
                    queue: config.queue.clone(),
                    error: e.to_string(),
                }
            })?;
        info!(
            event = %EventKind::QueueSubscribe,
            status = %EventStatus::Success,
            queue = %config.queue,
            durable = config.durable,
            "Consuming from queue"
        );

        Ok(Self {
            queue: config.queue.clone(),
            consumer,
            channel,
            connection,
        })
    }

    /// Closes the channel and the connection.
    pub async fn close(self) {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "relay shutting down").await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "relay shutting down").await {
            debug!(error = %e, "Connection close failed");
        }
    }
}

#[async_trait]
impl MessageSource for AmqpSource {
    async fn next_payload(&mut self) -> Result<Option<Payload>, SourceError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Payload::from(delivery.data))),
            Some(Err(e)) => Err(SourceError::Delivery(e.to_string())),
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        format!("amqp queue {}", self.queue)
    }
}

/// Hides the userinfo part of an AMQP URI before it is logged.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    match authority.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}{tail}"),
        None => url.to_string(),
    }
}
