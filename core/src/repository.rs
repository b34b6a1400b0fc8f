//! Repository abstraction for durable outbox storage.
//!
//! The [`OutboxRepository`] trait is the seam between the outbox processor and the
//! storage engine. Implementations:
//!
//! - `InMemoryOutboxRepository` (outbox-testing) - fast, deterministic, clock-driven
//! - `PostgresOutboxRepository` (outbox-postgres) - production storage via sqlx
//!
//! # Atomicity
//!
//! [`OutboxRepository::save_batch`] is all-or-nothing: every event produced by one
//! business transaction is recorded together or not at all. PostgreSQL callers that
//! own the business transaction enqueue through the adapter's transactional API
//! instead so the messages commit with the business row.
//!
//! # Claiming
//!
//! [`OutboxRepository::get_unpublished`] is a plain read. The processor polls through
//! [`OutboxRepository::claim_due`], which stamps a lease on the returned rows in the
//! same atomic step, so two processors sharing one store never hold the same message
//! at once. A crashed processor's claims expire with the lease.

use crate::event::{DomainEvent, EnvelopeError};
use crate::message::{MessageId, NewOutboxMessage, OutboxMessage};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during repository operations.
#[derive(Error, Debug, Clone)]
pub enum RepositoryError {
    /// The storage engine rejected or failed the operation.
    #[error("Database error: {0}")]
    Database(String),

    /// No message exists with this identifier.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// A value could not be encoded for, or decoded from, storage.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store is temporarily unreachable.
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

impl From<EnvelopeError> for RepositoryError {
    fn from(error: EnvelopeError) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Durable store for outbox messages.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the processor can hold an
/// `Arc<dyn OutboxRepository>` chosen at startup.
pub trait OutboxRepository: Send + Sync {
    /// Insert one message and return its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the insert fails.
    fn save(
        &self,
        message: NewOutboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<MessageId, RepositoryError>> + Send + '_>>;

    /// Insert all messages atomically, returning identifiers in input order.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if any insert fails; nothing is stored.
    fn save_batch(
        &self,
        messages: Vec<NewOutboxMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageId>, RepositoryError>> + Send + '_>>;

    /// Fetch one message.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the query fails.
    fn get(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxMessage>, RepositoryError>> + Send + '_>>;

    /// The oldest `limit` messages that are unpublished, not dead and due,
    /// ordered by creation time ascending.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the query fails.
    fn get_unpublished(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>;

    /// Like [`get_unpublished`](Self::get_unpublished), but skips messages claimed by
    /// someone else and claims the returned ones for `lease`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the claim fails; nothing is claimed.
    fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>;

    /// Mark a message delivered. Idempotent; clears any dead-letter mark and claim.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] for an unknown identifier.
    fn mark_published(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>>;

    /// Record a failed attempt: increment the retry count, store the error and
    /// schedule the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] for an unknown identifier.
    fn mark_failed(
        &self,
        id: MessageId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>>;

    /// Dead-letter a message.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] for an unknown identifier.
    fn mark_dead(
        &self,
        id: MessageId,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>>;

    /// Drop the claim on a message so the next poll can pick it up again.
    ///
    /// Used when a claimed message's transition could not be saved. Unknown
    /// identifiers and unclaimed messages are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the update fails; the claim then
    /// lapses when its lease expires.
    fn release_claim(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>>;

    /// Diagnostic: failed messages that still have retry budget
    /// (`0 < retry_count < max_retries`), oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the query fails.
    fn get_failed(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>;

    /// Diagnostic: dead-lettered messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the query fails.
    fn get_dead(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>;

    /// Operator replay: return a dead message to the queue with a fresh retry budget.
    ///
    /// Returns `false` if no dead message has this identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the update fails.
    fn replay_dead(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + '_>>;

    /// Delete messages published more than `older_than_days` ago; returns the count.
    ///
    /// Unpublished, failed and dead messages are never purged.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the delete fails.
    fn delete_old(
        &self,
        older_than_days: u32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + '_>>;
}

/// Wrap domain events as messages and save them as one atomic batch.
///
/// # Errors
///
/// Returns [`RepositoryError::Serialization`] if an event cannot be serialized,
/// or any error from [`OutboxRepository::save_batch`].
///
/// # Example
///
/// ```ignore
/// let ids = enqueue(&repository, &goal.take_events()).await?;
/// ```
pub async fn enqueue<R, E>(repository: &R, events: &[E]) -> Result<Vec<MessageId>, RepositoryError>
where
    R: OutboxRepository + ?Sized,
    E: DomainEvent,
{
    if events.is_empty() {
        return Ok(Vec::new());
    }

    let messages = events
        .iter()
        .map(NewOutboxMessage::from_event)
        .collect::<Result<Vec<_>, _>>()?;

    repository.save_batch(messages).await
}
