//! The outbox processor: poll, publish, retry, dead-letter.
//!
//! One [`OutboxProcessor`] owns one background loop. Each tick it claims a batch of
//! due messages, publishes each one and records the outcome on the message row:
//!
//! - publish ok → `mark_published`
//! - publish failed, budget left → `mark_failed` with `now + backoff(retry_count + 1)`
//! - publish failed, budget exhausted → `mark_dead` with the error text as reason
//!
//! The budget check is [`should_dead_letter`]. `max_retries = 0` means "dead-letter
//! on the first failure", not "retry forever".
//!
//! A transition that cannot be saved releases the message's claim so the next tick
//! polls it again.
//!
//! Every transition is committed on its own. Stopping or crashing mid-batch leaves
//! the remaining messages claimed until their lease expires, after which any
//! processor picks them up again.
//!
//! # Example
//!
//! ```ignore
//! let processor = OutboxProcessor::new(repository, publisher, ProcessorConfig::default());
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! processor.start(shutdown_rx).await;
//! // ...
//! processor.stop().await?;
//! ```

use crate::backoff::BackoffPolicy;
use crate::metrics::OutboxMetrics;
use chrono::{DateTime, Utc};
use outbox_core::environment::{Clock, SystemClock, add_duration};
use outbox_core::message::OutboxMessage;
use outbox_core::publisher::{PublishError, Publisher};
use outbox_core::repository::{OutboxRepository, RepositoryError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Errors reported by the processor.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Fetching the batch failed; the batch was abandoned.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The background loop panicked or was aborted.
    #[error("Processor task failed: {0}")]
    Task(String),
}

/// Processor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Time between batches.
    pub poll_interval: Duration,
    /// Maximum messages per batch.
    pub batch_size: usize,
    /// Failed attempts before dead-lettering; `0` dead-letters on the first failure.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub retry_base: Duration,
    /// Upper bound on the retry delay.
    pub retry_max: Duration,
    /// How long a claimed message stays reserved for this processor.
    pub claim_lease: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_retries: 5,
            retry_base: crate::backoff::DEFAULT_BASE,
            retry_max: crate::backoff::DEFAULT_CEILING,
            claim_lease: Duration::from_secs(300),
        }
    }
}

impl ProcessorConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff base and ceiling.
    #[must_use]
    pub const fn with_backoff(mut self, base: Duration, ceiling: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = ceiling;
        self
    }

    /// Set the claim lease.
    #[must_use]
    pub const fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    /// The backoff policy these settings describe.
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retry_base, self.retry_max)
    }
}

/// Whether the failure that is about to be recorded exhausts the retry budget.
///
/// `max_retries == 0` dead-letters on the first failure.
///
/// ```
/// use outbox_runtime::processor::should_dead_letter;
///
/// assert!(should_dead_letter(0, 0));
/// assert!(should_dead_letter(1, 0));
/// assert!(!should_dead_letter(3, 1));
/// assert!(should_dead_letter(3, 2));
/// ```
#[must_use]
pub const fn should_dead_letter(max_retries: u32, retry_count: u32) -> bool {
    max_retries == 0 || retry_count.saturating_add(1) >= max_retries
}

/// Snapshot of processor statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Whether the background loop is running.
    pub running: bool,
    /// Messages marked published.
    pub published: u64,
    /// Failed attempts scheduled for retry.
    pub failed: u64,
    /// Messages dead-lettered.
    pub dead: u64,
    /// Age of the oldest message in the last batch (zero if it was empty).
    pub lag: Duration,
    /// Most recent error text.
    pub last_error: Option<String>,
    /// When `last_error` was recorded.
    pub last_error_at: Option<DateTime<Utc>>,
    /// When the last batch started.
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Creation time of the oldest message in the last batch.
    pub oldest_message_at: Option<DateTime<Utc>>,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages claimed.
    pub fetched: usize,
    /// Messages marked published.
    pub published: usize,
    /// Messages scheduled for retry.
    pub failed: usize,
    /// Messages dead-lettered.
    pub dead: usize,
    /// State transitions that could not be persisted.
    pub transition_errors: usize,
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    repository: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    backoff: BackoffPolicy,
    stats: RwLock<ProcessorStats>,
    running: AtomicBool,
}

/// Polls the outbox and delivers messages through a [`Publisher`].
///
/// All state (counters, running flag, loop handle) belongs to this instance;
/// independent processors never share it.
pub struct OutboxProcessor {
    inner: Arc<Inner>,
    lifecycle: Mutex<Option<RunningLoop>>,
}

impl OutboxProcessor {
    /// Create a processor using the system clock.
    #[must_use]
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn Publisher>,
        config: ProcessorConfig,
    ) -> Self {
        Self::with_clock(repository, publisher, config, Arc::new(SystemClock))
    }

    /// Create a processor with an injected clock.
    #[must_use]
    pub fn with_clock(
        repository: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn Publisher>,
        config: ProcessorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                publisher,
                clock,
                backoff: config.backoff(),
                config,
                stats: RwLock::new(ProcessorStats::default()),
                running: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    /// Whether the background loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the background loop.
    ///
    /// Idempotent: calling it while the loop runs does nothing. The loop exits when
    /// `shutdown` turns `true` or [`stop`](Self::stop) is called.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) {
        let mut lifecycle = self.lifecycle.lock().await;

        if let Some(running) = lifecycle.as_ref() {
            if !running.handle.is_finished() {
                tracing::debug!("Outbox processor already running");
                return;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.inner.set_running(true);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(stop_rx, shutdown).await });

        tracing::info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis(),
            batch_size = self.inner.config.batch_size,
            max_retries = self.inner.config.max_retries,
            "Outbox processor started"
        );

        *lifecycle = Some(RunningLoop { stop_tx, handle });
    }

    /// Stop the background loop and wait for it to exit.
    ///
    /// Idempotent. When this returns no batch is in flight and
    /// [`is_running`](Self::is_running) is `false`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Task`] if the loop task panicked.
    pub async fn stop(&self) -> Result<(), ProcessorError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let Some(RunningLoop { stop_tx, handle }) = lifecycle.take() else {
            self.inner.set_running(false);
            return Ok(());
        };

        // The loop may already have exited on the external signal.
        stop_tx.send(true).ok();
        let joined = handle.await;
        self.inner.set_running(false);

        joined.map_err(|e| ProcessorError::Task(e.to_string()))
    }

    /// Run one batch now.
    ///
    /// Must not be called concurrently with a running loop on the same store
    /// unless the claim lease is longer than a batch takes.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Repository`] if the batch could not be fetched.
    pub async fn process_batch(&self) -> Result<BatchReport, ProcessorError> {
        self.inner.process_batch().await
    }

    /// Snapshot of the statistics.
    #[must_use]
    pub fn stats(&self) -> ProcessorStats {
        let mut stats = self
            .inner
            .stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.running = self.is_running();
        stats
    }
}

impl std::fmt::Debug for OutboxProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
        self.update_stats(|stats| stats.running = running);
    }

    fn update_stats(&self, update: impl FnOnce(&mut ProcessorStats)) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }

    fn record_error(&self, error: &str, at: DateTime<Utc>) {
        self.update_stats(|stats| {
            stats.last_error = Some(error.to_string());
            stats.last_error_at = Some(at);
        });
    }

    async fn run(&self, mut stop: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Fetch errors are logged and recorded in stats; retry next tick.
                    self.process_batch().await.ok();
                }
                () = crate::signalled(&mut stop) => {
                    tracing::debug!("Outbox processor received stop signal");
                    break;
                }
                () = crate::signalled(&mut shutdown) => {
                    tracing::debug!("Outbox processor received shutdown signal");
                    break;
                }
            }
        }

        self.set_running(false);
        tracing::info!("Outbox processor stopped");
    }

    async fn process_batch(&self) -> Result<BatchReport, ProcessorError> {
        let now = self.clock.now();

        let messages = match self
            .repository
            .claim_due(self.config.batch_size, self.config.claim_lease)
            .await
        {
            Ok(messages) => messages,
            Err(error) => {
                tracing::error!(error = %error, "Failed to fetch outbox batch");
                OutboxMetrics::record_fetch_error();
                self.record_error(&error.to_string(), now);
                return Err(error.into());
            }
        };

        let oldest = messages.iter().map(|message| message.created_at).min();
        let lag = oldest
            .and_then(|oldest| (now - oldest).to_std().ok())
            .unwrap_or(Duration::ZERO);

        self.update_stats(|stats| {
            stats.last_processed_at = Some(now);
            stats.oldest_message_at = oldest;
            stats.lag = lag;
        });
        OutboxMetrics::record_lag(lag);

        let mut report = BatchReport {
            fetched: messages.len(),
            ..BatchReport::default()
        };

        for message in &messages {
            self.process_message(message, &mut report).await;
        }

        if report.fetched > 0 {
            tracing::debug!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                dead = report.dead,
                transition_errors = report.transition_errors,
                lag_ms = lag.as_millis(),
                "Processed outbox batch"
            );
        }

        Ok(report)
    }

    async fn process_message(&self, message: &OutboxMessage, report: &mut BatchReport) {
        let started = Instant::now();
        let outcome = match message.to_envelope().and_then(|envelope| envelope.encode()) {
            Ok(bytes) => self.publisher.publish(&message.routing_key, &bytes).await,
            Err(error) => Err(PublishError::Encoding(error.to_string())),
        };
        let elapsed = started.elapsed();
        OutboxMetrics::record_publish_duration(elapsed);

        match outcome {
            Ok(()) => self.on_published(message, elapsed, report).await,
            Err(error) => self.on_failed(message, &error.to_string(), elapsed, report).await,
        }
    }

    async fn on_published(&self, message: &OutboxMessage, elapsed: Duration, report: &mut BatchReport) {
        match self.repository.mark_published(message.id).await {
            Ok(()) => {
                report.published += 1;
                self.update_stats(|stats| stats.published += 1);
                OutboxMetrics::record_published();
                tracing::debug!(
                    message_id = %message.id,
                    event_id = message.event_id.as_deref().unwrap_or_default(),
                    routing_key = %message.routing_key,
                    duration_ms = elapsed.as_millis(),
                    "Published outbox message"
                );
            }
            Err(error) => {
                report.transition_errors += 1;
                tracing::warn!(
                    message_id = %message.id,
                    routing_key = %message.routing_key,
                    error = %error,
                    "Published but failed to mark message; it will be redelivered"
                );
                self.release(message).await;
            }
        }
    }

    async fn on_failed(
        &self,
        message: &OutboxMessage,
        error: &str,
        elapsed: Duration,
        report: &mut BatchReport,
    ) {
        let now = self.clock.now();
        self.record_error(error, now);

        if should_dead_letter(self.config.max_retries, message.retry_count) {
            match self.repository.mark_dead(message.id, error).await {
                Ok(()) => {
                    report.dead += 1;
                    self.update_stats(|stats| stats.dead += 1);
                    OutboxMetrics::record_dead_lettered();
                    tracing::error!(
                        message_id = %message.id,
                        event_id = message.event_id.as_deref().unwrap_or_default(),
                        routing_key = %message.routing_key,
                        retry_count = message.retry_count,
                        duration_ms = elapsed.as_millis(),
                        error,
                        "Outbox message dead-lettered"
                    );
                }
                Err(mark_error) => {
                    report.transition_errors += 1;
                    tracing::warn!(
                        message_id = %message.id,
                        error = %mark_error,
                        "Failed to dead-letter outbox message"
                    );
                    self.release(message).await;
                }
            }
            return;
        }

        let attempts = message.retry_count.saturating_add(1);
        let delay = self.backoff.delay(attempts);
        let next_retry_at = add_duration(now, delay);

        match self.repository.mark_failed(message.id, error, next_retry_at).await {
            Ok(()) => {
                report.failed += 1;
                self.update_stats(|stats| stats.failed += 1);
                OutboxMetrics::record_failed();
                tracing::warn!(
                    message_id = %message.id,
                    event_id = message.event_id.as_deref().unwrap_or_default(),
                    routing_key = %message.routing_key,
                    attempt = attempts,
                    retry_in_ms = delay.as_millis(),
                    duration_ms = elapsed.as_millis(),
                    error,
                    "Outbox publish failed, retry scheduled"
                );
            }
            Err(mark_error) => {
                report.transition_errors += 1;
                tracing::warn!(
                    message_id = %message.id,
                    error = %mark_error,
                    "Failed to record outbox publish failure"
                );
                self.release(message).await;
            }
        }
    }

    /// Make a message whose transition was lost pollable again right away.
    async fn release(&self, message: &OutboxMessage) {
        if let Err(error) = self.repository.release_claim(message.id).await {
            tracing::warn!(
                message_id = %message.id,
                error = %error,
                lease_secs = self.config.claim_lease.as_secs(),
                "Failed to release claim; message waits for the lease to expire"
            );
        }
    }
}
