//! Prometheus metrics for the outbox processor.
//!
//! Metrics are emitted through the `metrics` facade and are no-ops until a recorder
//! is installed. [`MetricsServer::start`] installs the Prometheus recorder; the host
//! serves [`MetricsServer::render`] wherever it exposes scrape endpoints.
//!
//! # Example
//!
//! ```rust,no_run
//! use outbox_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new();
//! server.start()?;
//!
//! let scrape = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Messages marked published.
pub const PUBLISHED_TOTAL: &str = "outbox_messages_published_total";
/// Failed attempts that were scheduled for retry.
pub const FAILED_TOTAL: &str = "outbox_messages_failed_total";
/// Messages dead-lettered.
pub const DEAD_LETTERED_TOTAL: &str = "outbox_messages_dead_lettered_total";
/// Age of the oldest message in the last batch.
pub const LAG_SECONDS: &str = "outbox_lag_seconds";
/// Time spent in `Publisher::publish`.
pub const PUBLISH_DURATION_SECONDS: &str = "outbox_publish_duration_seconds";
/// Batches abandoned because the repository failed.
pub const FETCH_ERRORS_TOTAL: &str = "outbox_fetch_errors_total";
/// Published messages purged by the retention sweep.
pub const PURGED_TOTAL: &str = "outbox_messages_purged_total";
/// Dead messages returned to the queue by an operator (emitted by storage adapters).
pub const REPLAYED_TOTAL: &str = "outbox_messages_replayed_total";
/// Time spent in the claim query (emitted by storage adapters).
pub const CLAIM_DURATION_SECONDS: &str = "outbox_claim_duration_seconds";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder owner.
#[derive(Default)]
pub struct MetricsServer {
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server with no recorder installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed. A
    /// recorder that is already installed (e.g. by another test) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(PUBLISHED_TOTAL, "Total number of outbox messages published");
    describe_counter!(
        FAILED_TOTAL,
        "Total number of failed publish attempts scheduled for retry"
    );
    describe_counter!(
        DEAD_LETTERED_TOTAL,
        "Total number of outbox messages dead-lettered"
    );
    describe_counter!(
        FETCH_ERRORS_TOTAL,
        "Total number of batches abandoned due to repository errors"
    );
    describe_counter!(
        PURGED_TOTAL,
        "Total number of published messages removed by retention"
    );
    describe_gauge!(
        LAG_SECONDS,
        "Age in seconds of the oldest message in the last batch"
    );
    describe_histogram!(PUBLISH_DURATION_SECONDS, "Time taken to publish one message");
    describe_counter!(
        REPLAYED_TOTAL,
        "Total number of dead-lettered messages replayed"
    );
    describe_histogram!(CLAIM_DURATION_SECONDS, "Time taken to claim one batch");
}

/// Outbox processor metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record the duration of one publish attempt.
    pub fn record_publish_duration(duration: Duration) {
        histogram!(PUBLISH_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Record a message marked published.
    pub fn record_published() {
        counter!(PUBLISHED_TOTAL).increment(1);
    }

    /// Record a failed attempt scheduled for retry.
    pub fn record_failed() {
        counter!(FAILED_TOTAL).increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_lettered() {
        counter!(DEAD_LETTERED_TOTAL).increment(1);
    }

    /// Record an abandoned batch.
    pub fn record_fetch_error() {
        counter!(FETCH_ERRORS_TOTAL).increment(1);
    }

    /// Record the current lag.
    pub fn record_lag(lag: Duration) {
        gauge!(LAG_SECONDS).set(lag.as_secs_f64());
    }

    /// Record purged messages.
    pub fn record_purged(count: u64) {
        counter!(PURGED_TOTAL).increment(count);
    }
}
