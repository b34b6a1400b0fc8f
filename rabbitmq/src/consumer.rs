//! Broker consumer feeding a [`ConsumerRegistry`].
//!
//! One durable queue per consumer, bound to the exchange once for every routing
//! key a registered handler declares. Deliveries are settled by
//! [`decide_delivery`]:
//!
//! | outcome | broker action |
//! |---|---|
//! | handled | ack |
//! | a handler failed | nack + requeue |
//! | undecodable | ack (discarded) |
//!
//! Several consumers on the same queue compete for deliveries.

use crate::config::RabbitMqConfig;
use crate::publisher::declare_exchange;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use outbox_core::consumer::{ConsumerRegistry, DeliveryOutcome, EventHandler, decide_delivery};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors from the broker consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The broker is unreachable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel, queue or binding setup failed.
    #[error("Channel error: {0}")]
    Channel(String),

    /// `start` was called while the receive loop is running.
    #[error("Consumer is already running")]
    AlreadyRunning,

    /// The consumer has been closed.
    #[error("Consumer is closed")]
    Closed,

    /// The receive task panicked.
    #[error("Consumer task failed: {0}")]
    Task(String),
}

struct ReceiveLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// RabbitMQ consumer.
///
/// # Lifecycle
///
/// not started → [`start`](Self::start) → running → [`close`](Self::close) (idempotent)
/// or upstream shutdown. A second `start` while running is
/// [`ConsumerError::AlreadyRunning`].
pub struct RabbitMqConsumer {
    connection: Connection,
    channel: Channel,
    config: RabbitMqConfig,
    registry: Arc<ConsumerRegistry>,
    bound: Mutex<HashSet<String>>,
    receive_loop: tokio::sync::Mutex<Option<ReceiveLoop>>,
    closed: AtomicBool,
}

impl RabbitMqConsumer {
    /// Connect, declare exchange and queue, and apply the prefetch limit.
    ///
    /// Handlers already in `registry` are bound immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Connection`] if the broker is unreachable or
    /// [`ConsumerError::Channel`] if a declaration fails.
    pub async fn connect(
        config: RabbitMqConfig,
        registry: Arc<ConsumerRegistry>,
    ) -> Result<Self, ConsumerError> {
        let connection = Connection::connect(
            &config.url,
            ConnectionProperties::default()
                .with_connection_name(format!("{}-consumer", config.connection_name).into()),
        )
        .await
        .map_err(|e| ConsumerError::Connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConsumerError::Channel(format!("Channel creation failed: {e}")))?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| ConsumerError::Channel(format!("Failed to set QoS: {e}")))?;

        declare_exchange(&channel, &config.exchange)
            .await
            .map_err(|e| ConsumerError::Channel(format!("Exchange declaration failed: {e}")))?;

        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Channel(format!("Queue declaration failed: {e}")))?;

        tracing::info!(
            url = %config.url_redacted(),
            exchange = %config.exchange,
            queue = %config.queue,
            prefetch = config.prefetch,
            "RabbitMQ consumer connected"
        );

        let consumer = Self {
            connection,
            channel,
            config,
            registry,
            bound: Mutex::new(HashSet::new()),
            receive_loop: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        for routing_key in consumer.registry.routing_keys() {
            consumer.bind(&routing_key).await?;
        }
        Ok(consumer)
    }

    /// The registry deliveries are dispatched into.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    /// Register `handler` and bind the queue for each of its routing keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Channel`] if a binding fails, or
    /// [`ConsumerError::Closed`] after [`close`](Self::close).
    pub async fn register(&self, handler: Arc<dyn EventHandler>) -> Result<(), ConsumerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerError::Closed);
        }
        for routing_key in self.registry.register(handler) {
            self.bind(&routing_key).await?;
        }
        Ok(())
    }

    /// Bind once per routing key.
    async fn bind(&self, routing_key: &str) -> Result<(), ConsumerError> {
        let fresh = self
            .bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(routing_key.to_string());
        if !fresh {
            return Ok(());
        }

        let result = self
            .channel
            .queue_bind(
                &self.config.queue,
                &self.config.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await;

        if let Err(e) = result {
            self.bound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(routing_key);
            return Err(ConsumerError::Channel(format!(
                "Failed to bind {routing_key}: {e}"
            )));
        }

        tracing::debug!(queue = %self.config.queue, routing_key, "Queue bound");
        Ok(())
    }

    /// Whether the receive loop is running.
    pub async fn is_running(&self) -> bool {
        self.receive_loop
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Start the receive loop. It ends on [`close`](Self::close), when `shutdown`
    /// turns `true`, or when the broker cancels the subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::AlreadyRunning`] if the loop is running,
    /// [`ConsumerError::Closed`] after `close`, or [`ConsumerError::Channel`] if the
    /// subscription cannot be created.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerError::Closed);
        }

        let mut receive_loop = self.receive_loop.lock().await;
        if receive_loop
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return Err(ConsumerError::AlreadyRunning);
        }

        let consumer_tag = format!("{}-{}", self.config.connection_name, self.config.queue);
        let deliveries = self
            .channel
            .basic_consume(
                &self.config.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Channel(format!("Failed to start consuming: {e}")))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(receive(
            deliveries,
            self.channel.clone(),
            consumer_tag,
            Arc::clone(&self.registry),
            stop_rx,
            shutdown,
        ));

        tracing::info!(queue = %self.config.queue, "RabbitMQ consumer started");
        *receive_loop = Some(ReceiveLoop { stop_tx, handle });
        Ok(())
    }

    /// Stop the receive loop and close channel and connection. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Task`] if the receive task panicked.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = self.receive_loop.lock().await.take();
        let joined = match running {
            Some(ReceiveLoop { stop_tx, handle }) => {
                stop_tx.send(true).ok();
                handle.await.map_err(|e| ConsumerError::Task(e.to_string()))
            }
            None => Ok(()),
        };

        if let Err(e) = self.channel.close(200, "consumer closed").await {
            tracing::debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close(200, "consumer closed").await {
            tracing::debug!(error = %e, "Connection close failed");
        }

        tracing::info!(queue = %self.config.queue, "RabbitMQ consumer closed");
        joined
    }
}

async fn receive(
    mut deliveries: lapin::Consumer,
    channel: Channel,
    consumer_tag: String,
    registry: Arc<ConsumerRegistry>,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => settle(&registry, delivery).await,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to receive delivery");
                }
                None => {
                    tracing::info!("Broker cancelled the subscription");
                    return;
                }
            },
            // A dropped sender fails the pattern and only disables that branch
            Ok(()) = async { stop.wait_for(|stopped| *stopped).await.map(drop) } => break,
            Ok(()) = async { shutdown.wait_for(|stopped| *stopped).await.map(drop) } => break,
        }
    }

    // Unacked in-flight deliveries go back to the queue when the channel closes
    if let Err(e) = channel
        .basic_cancel(&consumer_tag, BasicCancelOptions::default())
        .await
    {
        tracing::debug!(error = %e, "basic_cancel failed");
    }
    tracing::debug!("Consumer task exiting");
}

async fn settle(registry: &ConsumerRegistry, delivery: Delivery) {
    let transport_key = delivery.routing_key.as_str();
    let outcome = decide_delivery(registry, &delivery.data, transport_key).await;

    let result = match outcome {
        DeliveryOutcome::Ack | DeliveryOutcome::Discard => {
            delivery.acker.ack(BasicAckOptions::default()).await
        }
        DeliveryOutcome::Requeue => {
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
    };

    match result {
        Ok(()) => tracing::trace!(
            delivery_tag = delivery.delivery_tag,
            routing_key = transport_key,
            outcome = ?outcome,
            "Delivery settled"
        ),
        // The broker redelivers anything left unsettled
        Err(e) => tracing::warn!(
            delivery_tag = delivery.delivery_tag,
            routing_key = transport_key,
            error = %e,
            "Failed to settle delivery"
        ),
    }
}

impl std::fmt::Debug for RabbitMqConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqConsumer")
            .field("exchange", &self.config.exchange)
            .field("queue", &self.config.queue)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rabbitmq_consumer_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RabbitMqConsumer>();
        assert_sync::<RabbitMqConsumer>();
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConsumerError::AlreadyRunning.to_string(),
            "Consumer is already running"
        );
        assert_eq!(
            ConsumerError::Channel("no queue".to_string()).to_string(),
            "Channel error: no queue"
        );
    }
}
