//! DDL for the `outbox_messages` table.
//!
//! Retry scheduling, dead-letter marks and claim leases live on the row, so
//! one table is the whole durable state of the outbox.

/// Statements applied by [`PostgresOutboxRepository::ensure_schema`](crate::PostgresOutboxRepository::ensure_schema),
/// in order. Every statement is idempotent.
pub const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS outbox_messages (
        id BIGSERIAL PRIMARY KEY,
        event_id TEXT,
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        routing_key TEXT NOT NULL,
        payload BYTEA NOT NULL,
        metadata TEXT,
        occurred_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        published_at TIMESTAMPTZ,
        next_retry_at TIMESTAMPTZ,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        dead_lettered_at TIMESTAMPTZ,
        dead_letter_reason TEXT,
        claimed_until TIMESTAMPTZ
    )
    ",
    // Polling path: pending rows only, oldest first
    r"
    CREATE INDEX IF NOT EXISTS idx_outbox_pending
        ON outbox_messages (created_at, id)
        WHERE published_at IS NULL AND dead_lettered_at IS NULL
    ",
    // Retention path
    r"
    CREATE INDEX IF NOT EXISTS idx_outbox_published
        ON outbox_messages (published_at)
        WHERE published_at IS NOT NULL
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_outbox_dead
        ON outbox_messages (dead_lettered_at)
        WHERE dead_lettered_at IS NOT NULL
    ",
];
