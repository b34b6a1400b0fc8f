//! Periodic purge of published messages.
//!
//! Retention is the only deletion path for outbox rows: published messages older
//! than the retention window are removed on a fixed interval. Unpublished, failed
//! and dead messages are never touched.

use crate::metrics::OutboxMetrics;
use outbox_core::repository::{OutboxRepository, RepositoryError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Default retention window.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Deletes published messages past the retention window.
pub struct RetentionSweeper {
    repository: Arc<dyn OutboxRepository>,
    retention_days: u32,
    interval: Duration,
}

impl RetentionSweeper {
    /// Create a sweeper with the default window and interval.
    #[must_use]
    pub const fn new(repository: Arc<dyn OutboxRepository>) -> Self {
        Self {
            repository,
            retention_days: DEFAULT_RETENTION_DAYS,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Set the retention window in days.
    #[must_use]
    pub const fn with_retention_days(mut self, retention_days: u32) -> Self {
        self.retention_days = retention_days;
        self
    }

    /// Set the time between sweeps.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one sweep; returns the number of messages removed.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the delete fails.
    pub async fn sweep_once(&self) -> Result<u64, RepositoryError> {
        let removed = self.repository.delete_old(self.retention_days).await?;
        OutboxMetrics::record_purged(removed);

        if removed > 0 {
            tracing::info!(
                removed,
                retention_days = self.retention_days,
                "Purged published outbox messages"
            );
        }
        Ok(removed)
    }

    /// Sweep on every interval until `shutdown` turns `true`.
    ///
    /// The first sweep runs immediately. Errors are logged and retried next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            retention_days = self.retention_days,
            interval_secs = self.interval.as_secs(),
            "Retention sweeper started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.sweep_once().await {
                        tracing::warn!(error = %error, "Retention sweep failed");
                    }
                }
                () = crate::signalled(&mut shutdown) => break,
            }
        }

        tracing::info!("Retention sweeper stopped");
    }
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("retention_days", &self.retention_days)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
