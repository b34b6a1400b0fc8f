//! `PostgreSQL` outbox repository.
//!
//! This crate provides the production [`OutboxRepository`] backed by a single
//! `outbox_messages` table. It uses sqlx and supports:
//!
//! - Transactional enqueue alongside business writes ([`enqueue_in_tx`])
//! - Concurrent processors via `FOR UPDATE SKIP LOCKED` claims with a lease
//! - Dead-letter inspection and operator replay
//! - Retention purge of published rows
//!
//! # Example
//!
//! ```ignore
//! use outbox_postgres::{PostgresOutboxRepository, enqueue_in_tx};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let repository = PostgresOutboxRepository::new("postgres://localhost/mydb").await?;
//!     repository.ensure_schema().await?;
//!
//!     let mut tx = repository.pool().begin().await?;
//!     // ... business writes on &mut *tx ...
//!     enqueue_in_tx(&mut tx, &goal.take_events()).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod schema;

pub use schema::SCHEMA;

use chrono::{DateTime, Utc};
use outbox_core::event::DomainEvent;
use outbox_core::message::{MessageId, NewOutboxMessage, OutboxMessage};
use outbox_core::repository::{OutboxRepository, RepositoryError};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// Default pool size for [`PostgresOutboxRepository::new`].
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

macro_rules! columns {
    () => {
        "id, event_id, aggregate_type, aggregate_id, event_type, routing_key, payload, \
         metadata, occurred_at, created_at, published_at, next_retry_at, retry_count, \
         last_error, dead_lettered_at, dead_letter_reason, claimed_until"
    };
}

const INSERT: &str = r"
    INSERT INTO outbox_messages (
        event_id, aggregate_type, aggregate_id, event_type, routing_key,
        payload, metadata, occurred_at, created_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    RETURNING id
";

/// `PostgreSQL`-backed [`OutboxRepository`].
#[derive(Debug, Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    /// Connect to `database_url` with a pool of [`DEFAULT_MAX_CONNECTIONS`].
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Unavailable`] if the database cannot be reached.
    pub async fn new(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Use an existing pool, typically the one the business code writes through.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if a statement fails.
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(database_error)?;
        }
        tracing::debug!("Outbox schema ensured");
        Ok(())
    }

    /// Distinguishes "no such row" from "row exists but the guard excluded it".
    async fn exists(&self, id: MessageId) -> Result<bool, RepositoryError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM outbox_messages WHERE id = $1)")
            .bind(id.value())
            .fetch_one(&self.pool)
            .await
            .map_err(database_error)
    }

    async fn fetch(&self, sql: &str, binds: &[i64]) -> Result<Vec<OutboxMessage>, RepositoryError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(database_error)?;
        rows.iter().map(message_from_row).collect()
    }
}

/// Enqueue domain events inside a caller-owned transaction.
///
/// The messages commit or roll back with the caller's business writes.
///
/// # Errors
///
/// Returns [`RepositoryError::Serialization`] if an event cannot be serialized, or
/// [`RepositoryError::Database`] if an insert fails (the caller should roll back).
pub async fn enqueue_in_tx<E: DomainEvent>(
    tx: &mut Transaction<'_, Postgres>,
    events: &[E],
) -> Result<Vec<MessageId>, RepositoryError> {
    let mut ids = Vec::with_capacity(events.len());
    for event in events {
        let message = NewOutboxMessage::from_event(event)?;
        ids.push(insert(&mut **tx, &message).await.map_err(database_error)?);
    }

    if !ids.is_empty() {
        tracing::debug!(count = ids.len(), "Enqueued outbox messages in transaction");
    }
    Ok(ids)
}

async fn insert<'e, X>(executor: X, message: &NewOutboxMessage) -> Result<MessageId, sqlx::Error>
where
    X: PgExecutor<'e>,
{
    let id: i64 = sqlx::query_scalar(INSERT)
        .bind(message.event_id.as_deref())
        .bind(&message.aggregate_type)
        .bind(&message.aggregate_id)
        .bind(&message.event_type)
        .bind(&message.routing_key)
        .bind(&message.payload)
        .bind(message.metadata.as_deref())
        .bind(message.occurred_at)
        .bind(message.created_at)
        .fetch_one(executor)
        .await?;
    Ok(MessageId::new(id))
}

fn database_error(error: sqlx::Error) -> RepositoryError {
    match &error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Unavailable(error.to_string())
        }
        _ => RepositoryError::Database(error.to_string()),
    }
}

#[allow(clippy::needless_pass_by_value)] // used as a map_err adapter
fn column_error(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Serialization(error.to_string())
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, RepositoryError> {
    let retry_count: i32 = row.try_get("retry_count").map_err(column_error)?;

    Ok(OutboxMessage {
        id: MessageId::new(row.try_get("id").map_err(column_error)?),
        event_id: row.try_get("event_id").map_err(column_error)?,
        aggregate_type: row.try_get("aggregate_type").map_err(column_error)?,
        aggregate_id: row.try_get("aggregate_id").map_err(column_error)?,
        event_type: row.try_get("event_type").map_err(column_error)?,
        routing_key: row.try_get("routing_key").map_err(column_error)?,
        payload: row.try_get("payload").map_err(column_error)?,
        metadata: row.try_get("metadata").map_err(column_error)?,
        occurred_at: row.try_get("occurred_at").map_err(column_error)?,
        created_at: row.try_get("created_at").map_err(column_error)?,
        published_at: row.try_get("published_at").map_err(column_error)?,
        next_retry_at: row.try_get("next_retry_at").map_err(column_error)?,
        retry_count: u32::try_from(retry_count).unwrap_or_default(),
        last_error: row.try_get("last_error").map_err(column_error)?,
        dead_lettered_at: row.try_get("dead_lettered_at").map_err(column_error)?,
        dead_letter_reason: row.try_get("dead_letter_reason").map_err(column_error)?,
        claimed_until: row.try_get("claimed_until").map_err(column_error)?,
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl OutboxRepository for PostgresOutboxRepository {
    fn save(
        &self,
        message: NewOutboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<MessageId, RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            let id = insert(&self.pool, &message).await.map_err(database_error)?;

            tracing::debug!(
                message_id = %id,
                routing_key = %message.routing_key,
                "Outbox message saved"
            );
            Ok(id)
        })
    }

    fn save_batch(
        &self,
        messages: Vec<NewOutboxMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageId>, RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            if messages.is_empty() {
                return Ok(Vec::new());
            }

            let mut tx = self.pool.begin().await.map_err(database_error)?;
            let mut ids = Vec::with_capacity(messages.len());
            for message in &messages {
                // Dropping `tx` on error rolls the whole batch back
                ids.push(insert(&mut *tx, message).await.map_err(database_error)?);
            }
            tx.commit().await.map_err(database_error)?;

            tracing::debug!(count = ids.len(), "Outbox batch saved");
            Ok(ids)
        })
    }

    fn get(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            let row = sqlx::query(concat!(
                "SELECT ",
                columns!(),
                " FROM outbox_messages WHERE id = $1"
            ))
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?;

            row.as_ref().map(message_from_row).transpose()
        })
    }

    fn get_unpublished(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            self.fetch(
                concat!(
                    "SELECT ",
                    columns!(),
                    " FROM outbox_messages
                      WHERE published_at IS NULL
                        AND dead_lettered_at IS NULL
                        AND (next_retry_at IS NULL OR next_retry_at <= now())
                      ORDER BY created_at ASC, id ASC
                      LIMIT $1"
                ),
                &[sql_limit(limit)],
            )
            .await
        })
    }

    fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            let started = Instant::now();

            // `due_id` keeps `id` unambiguous in RETURNING
            let rows = sqlx::query(concat!(
                r"
                WITH due AS (
                    SELECT id AS due_id FROM outbox_messages
                    WHERE published_at IS NULL
                      AND dead_lettered_at IS NULL
                      AND (next_retry_at IS NULL OR next_retry_at <= now())
                      AND (claimed_until IS NULL OR claimed_until <= now())
                    ORDER BY created_at ASC, id ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE outbox_messages
                SET claimed_until = now() + make_interval(secs => $2)
                FROM due
                WHERE outbox_messages.id = due.due_id
                RETURNING ",
                columns!()
            ))
            .bind(sql_limit(limit))
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(database_error)?;

            let mut messages = rows
                .iter()
                .map(message_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            // RETURNING order is unspecified
            messages.sort_by_key(|message| (message.created_at, message.id));

            metrics::histogram!("outbox_claim_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            Ok(messages)
        })
    }

    fn mark_published(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET published_at = COALESCE(published_at, now()),
                    dead_lettered_at = NULL,
                    dead_letter_reason = NULL,
                    claimed_until = NULL
                WHERE id = $1
                ",
            )
            .bind(id.value())
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound(id));
            }
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        id: MessageId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>> {
        let error = error.to_string();

        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET retry_count = retry_count + 1,
                    last_error = $2,
                    next_retry_at = $3,
                    claimed_until = NULL
                WHERE id = $1 AND published_at IS NULL
                ",
            )
            .bind(id.value())
            .bind(&error)
            .bind(next_retry_at)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

            // Published rows are left alone; only a missing row is an error
            if result.rows_affected() == 0 && !self.exists(id).await? {
                return Err(RepositoryError::NotFound(id));
            }
            Ok(())
        })
    }

    fn mark_dead(
        &self,
        id: MessageId,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>> {
        let reason = reason.to_string();

        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET dead_lettered_at = now(),
                    dead_letter_reason = $2,
                    last_error = $2,
                    claimed_until = NULL
                WHERE id = $1 AND published_at IS NULL
                ",
            )
            .bind(id.value())
            .bind(&reason)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

            if result.rows_affected() == 0 {
                if !self.exists(id).await? {
                    return Err(RepositoryError::NotFound(id));
                }
                return Ok(());
            }

            tracing::warn!(message_id = %id, reason = %reason, "Outbox message dead-lettered");
            Ok(())
        })
    }

    fn release_claim(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("UPDATE outbox_messages SET claimed_until = NULL WHERE id = $1")
                .bind(id.value())
                .execute(&self.pool)
                .await
                .map_err(database_error)?;
            Ok(())
        })
    }

    fn get_failed(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            self.fetch(
                concat!(
                    "SELECT ",
                    columns!(),
                    " FROM outbox_messages
                      WHERE published_at IS NULL
                        AND dead_lettered_at IS NULL
                        AND retry_count > 0
                        AND retry_count < $1
                      ORDER BY created_at ASC, id ASC
                      LIMIT $2"
                ),
                &[i64::from(max_retries), sql_limit(limit)],
            )
            .await
        })
    }

    fn get_dead(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            self.fetch(
                concat!(
                    "SELECT ",
                    columns!(),
                    " FROM outbox_messages
                      WHERE dead_lettered_at IS NOT NULL
                      ORDER BY created_at ASC, id ASC
                      LIMIT $1"
                ),
                &[sql_limit(limit)],
            )
            .await
        })
    }

    fn replay_dead(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET dead_lettered_at = NULL,
                    dead_letter_reason = NULL,
                    last_error = NULL,
                    retry_count = 0,
                    next_retry_at = NULL,
                    claimed_until = NULL
                WHERE id = $1
                  AND dead_lettered_at IS NOT NULL
                  AND published_at IS NULL
                ",
            )
            .bind(id.value())
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

            let replayed = result.rows_affected() > 0;
            if replayed {
                tracing::info!(message_id = %id, "Dead outbox message replayed");
                metrics::counter!("outbox_messages_replayed_total").increment(1);
            }
            Ok(replayed)
        })
    }

    fn delete_old(
        &self,
        older_than_days: u32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                DELETE FROM outbox_messages
                WHERE published_at < now() - make_interval(days => $1)
                ",
            )
            .bind(i32::try_from(older_than_days).unwrap_or(i32::MAX))
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

            Ok(result.rows_affected())
        })
    }
}
