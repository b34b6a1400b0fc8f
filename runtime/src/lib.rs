//! # Outbox Runtime
//!
//! Delivery side of the transactional outbox.
//!
//! - [`processor::OutboxProcessor`]: the polling state machine (claim, publish,
//!   retry with backoff, dead-letter) with a statistics snapshot
//! - [`backoff::BackoffPolicy`]: `min(base * 2^(n-1), ceiling)`
//! - [`in_process::InProcessPublisher`]: broker-less transport into a
//!   [`ConsumerRegistry`](outbox_core::consumer::ConsumerRegistry)
//! - [`retention::RetentionSweeper`]: periodic purge of published messages
//! - [`config::OutboxConfig`]: environment configuration and transport selection
//! - [`metrics`]: metric names, descriptions and the Prometheus recorder
//!
//! ## Example
//!
//! ```ignore
//! let config = OutboxConfig::from_env()?;
//! let processor = OutboxProcessor::new(repository, publisher, config.processor);
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! processor.start(shutdown_rx).await;
//!
//! tokio::signal::ctrl_c().await?;
//! shutdown_tx.send(true).ok();
//! processor.stop().await?;
//! ```

pub mod backoff;
pub mod config;
pub mod in_process;
pub mod metrics;
pub mod processor;
pub mod retention;

pub use backoff::BackoffPolicy;
pub use config::{ConfigError, OutboxConfig, TransportKind};
pub use in_process::InProcessPublisher;
pub use processor::{BatchReport, OutboxProcessor, ProcessorConfig, ProcessorError, ProcessorStats};
pub use retention::RetentionSweeper;

use tokio::sync::watch;

/// Resolves once the receiver holds `true`; never resolves if the sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|value| *value).await.is_err() {
        std::future::pending::<()>().await;
    }
}
