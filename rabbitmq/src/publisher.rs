//! Broker-backed [`Publisher`].

use crate::config::RabbitMqConfig;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use outbox_core::publisher::{PublishError, Publisher};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Publishes outbox messages to a durable RabbitMQ topic exchange.
///
/// Every publish is persistent and waits for the broker's publisher confirm, so
/// `Ok(())` means the broker has taken responsibility for the message.
///
/// # Example
///
/// ```no_run
/// use outbox_rabbitmq::{RabbitMqConfig, RabbitMqPublisher};
/// use outbox_core::publisher::Publisher;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = RabbitMqPublisher::connect(&RabbitMqConfig::from_env()).await?;
/// publisher.publish("wellness.goal.created", b"...").await?;
/// publisher.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct RabbitMqPublisher {
    connection: Connection,
    channel: Channel,
    exchange: String,
    closed: AtomicBool,
}

impl RabbitMqPublisher {
    /// Connect, enable publisher confirms and declare the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Connection`] if the broker is unreachable or
    /// [`PublishError::Channel`] if channel setup or the exchange declaration fails.
    pub async fn connect(config: &RabbitMqConfig) -> Result<Self, PublishError> {
        let connection = Connection::connect(
            &config.url,
            ConnectionProperties::default()
                .with_connection_name(format!("{}-publisher", config.connection_name).into()),
        )
        .await
        .map_err(|e| PublishError::Connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PublishError::Channel(format!("Channel creation failed: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublishError::Channel(format!("Failed to enable confirms: {e}")))?;

        declare_exchange(&channel, &config.exchange)
            .await
            .map_err(|e| PublishError::Channel(format!("Exchange declaration failed: {e}")))?;

        tracing::info!(
            url = %config.url_redacted(),
            exchange = %config.exchange,
            "RabbitMQ publisher connected"
        );

        Ok(Self {
            connection,
            channel,
            exchange: config.exchange.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// The exchange this publisher writes to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

/// Declare the durable topic exchange shared by publisher and consumer.
pub(crate) async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
}

/// Classify a lapin error for the processor's logs and stats.
pub(crate) fn publish_error(error: &lapin::Error) -> PublishError {
    match error {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            PublishError::Connection(error.to_string())
        }
        _ => PublishError::Channel(error.to_string()),
    }
}

impl Publisher for RabbitMqPublisher {
    fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        // Clone data before moving into async block
        let routing_key = routing_key.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PublishError::Closed);
            }

            let confirm = self
                .channel
                .basic_publish(
                    &self.exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default()
                        .with_delivery_mode(PERSISTENT)
                        .with_content_type("application/octet-stream".into()),
                )
                .await
                .map_err(|e| publish_error(&e))?;

            let confirmation = confirm.await.map_err(|e| publish_error(&e))?;
            if confirmation.is_nack() {
                tracing::warn!(routing_key = %routing_key, "Broker nacked outbox message");
                return Err(PublishError::Rejected(format!(
                    "broker nacked message on {routing_key}"
                )));
            }

            tracing::debug!(
                exchange = %self.exchange,
                routing_key = %routing_key,
                bytes = payload.len(),
                "Message confirmed by broker"
            );
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            // A connection the broker already dropped is as closed as it gets
            if let Err(e) = self.channel.close(200, "publisher closed").await {
                tracing::debug!(error = %e, "Channel close failed");
            }
            if let Err(e) = self.connection.close(200, "publisher closed").await {
                tracing::debug!(error = %e, "Connection close failed");
            }

            tracing::info!(exchange = %self.exchange, "RabbitMQ publisher closed");
            Ok(())
        })
    }
}

impl std::fmt::Debug for RabbitMqPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqPublisher")
            .field("exchange", &self.exchange)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rabbitmq_publisher_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RabbitMqPublisher>();
        assert_sync::<RabbitMqPublisher>();
    }

    #[test]
    fn test_io_errors_are_connection_errors() {
        let io = lapin::Error::IOError(std::sync::Arc::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(matches!(publish_error(&io), PublishError::Connection(_)));
        assert!(matches!(
            publish_error(&lapin::Error::ChannelsLimitReached),
            PublishError::Channel(_)
        ));
    }
}
