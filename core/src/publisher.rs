//! Publisher abstraction for outbound delivery.
//!
//! A [`Publisher`] has exactly two operations: `publish` and `close`. Transports:
//!
//! - `RabbitMqPublisher` (outbox-rabbitmq) - AMQP topic exchange, persistent messages
//! - `InProcessPublisher` (outbox-runtime) - dispatches straight into a [`ConsumerRegistry`]
//! - [`NoopPublisher`] - accepts and discards everything
//!
//! [`ConsumerRegistry`]: crate::consumer::ConsumerRegistry

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during publishing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Failed to establish or use the broker connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Failed to open or use a channel.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The broker refused the message.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// The publisher has been closed.
    #[error("Publisher is closed")]
    Closed,

    /// The message could not be encoded for the transport.
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Outbound transport.
///
/// Implementations must be safe to share across tasks. `close` is idempotent, and
/// `publish` after `close` fails with [`PublishError::Closed`] unless the
/// implementation documents otherwise.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the processor can hold an
/// `Arc<dyn Publisher>` chosen from configuration.
pub trait Publisher: Send + Sync {
    /// Deliver `payload` under `routing_key`.
    ///
    /// Returns once the transport has accepted the message (for a broker, after
    /// the publish confirm).
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] if the transport did not accept the message.
    fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>>;

    /// Release transport resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] if resources could not be released cleanly.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>>;
}

/// Publisher that accepts and discards every message.
///
/// Useful when the processor should drain the outbox without a broker, e.g. in
/// environments where downstream delivery is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl NoopPublisher {
    /// Create a no-op publisher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Publisher for NoopPublisher {
    fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        tracing::debug!(routing_key, size = payload.len(), "Discarding message (noop publisher)");
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
