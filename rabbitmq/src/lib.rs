//! RabbitMQ transport for the transactional outbox.
//!
//! - [`RabbitMqPublisher`]: the broker-backed
//!   [`Publisher`](outbox_core::publisher::Publisher) used by the outbox processor
//! - [`RabbitMqConsumer`]: receives from a durable queue and dispatches into a
//!   [`ConsumerRegistry`](outbox_core::consumer::ConsumerRegistry)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────────────┐      ┌─────────────────┐
//! │ OutboxProcessor  │─────►│ topic exchange       │─────►│ durable queue   │
//! │ (publish+confirm)│      │ (routing key = event)│ bind │ (prefetch 1)    │
//! └──────────────────┘      └──────────────────────┘      └────────┬────────┘
//!                                                                  │
//!                                                                  ▼
//!                                                         ┌─────────────────┐
//!                                                         │ ConsumerRegistry│
//!                                                         └─────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once**. Messages are persistent and confirmed on publish; consumers
//! ack only after every handler succeeded and requeue otherwise. Handlers MUST be
//! idempotent on the envelope's event id.
//!
//! # Example
//!
//! ```no_run
//! use outbox_core::consumer::ConsumerRegistry;
//! use outbox_rabbitmq::{RabbitMqConfig, RabbitMqConsumer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ConsumerRegistry::new());
//! let consumer = RabbitMqConsumer::connect(RabbitMqConfig::from_env(), registry).await?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! consumer.start(shutdown_rx).await?;
//! // ...
//! shutdown_tx.send(true)?;
//! consumer.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod publisher;

pub use config::{RabbitMqConfig, RabbitMqConfigBuilder};
pub use consumer::{ConsumerError, RabbitMqConsumer};
pub use publisher::RabbitMqPublisher;
