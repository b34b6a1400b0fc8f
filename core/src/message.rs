//! Outbox messages and their lifecycle.
//!
//! A message is created from a [`DomainEvent`] in the same transaction as the
//! business change that produced it, and then moves through:
//!
//! ```text
//!              publish ok
//! Unpublished ───────────────────────────────► Published
//!      │                                          ▲
//!      │ publish failed                           │ publish ok
//!      ▼                                          │
//!  Failed(n) ──── retry due ──────────────────────┘
//!      │
//!      │ retry budget exhausted
//!      ▼
//!    Dead ──── replay ───► Unpublished
//! ```
//!
//! Retry scheduling lives on the message itself (`retry_count`, `next_retry_at`), so
//! "what to retry and when" is a pure function of durable state.
//!
//! The `apply_*` methods are the canonical transitions. Storage adapters either call
//! them directly (in-memory) or mirror them in SQL (PostgreSQL).

use crate::event::{DomainEvent, EnvelopeError, EventEnvelope, EventMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned message identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(i64);

impl MessageId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derived lifecycle state of a stored message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    /// Never attempted, or replayed from dead.
    Unpublished,
    /// At least one failed attempt; still retryable.
    Failed {
        /// Failed attempts so far.
        retry_count: u32,
    },
    /// Delivered (terminal).
    Published,
    /// Retry budget exhausted (terminal until replayed).
    Dead,
}

/// A message that has not been stored yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOutboxMessage {
    /// Deduplication key from the originating event.
    pub event_id: Option<String>,
    /// Aggregate type.
    pub aggregate_type: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Event type.
    pub event_type: String,
    /// Routing key.
    pub routing_key: String,
    /// Serialized event body.
    pub payload: Vec<u8>,
    /// Serialized [`EventMetadata`], if any.
    pub metadata: Option<String>,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl NewOutboxMessage {
    /// Wrap a domain event.
    ///
    /// Empty metadata is stored as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SerializationError`] if the event or its metadata
    /// cannot be serialized.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, EnvelopeError> {
        let metadata = event.metadata();
        let metadata = if metadata.is_empty() {
            None
        } else {
            Some(metadata.to_json()?)
        };
        let event_id = event.event_id();

        Ok(Self {
            event_id: (!event_id.is_empty()).then(|| event_id.to_string()),
            aggregate_type: event.aggregate_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            event_type: event.event_type().to_string(),
            routing_key: event.routing_key().to_string(),
            payload: event.to_payload()?,
            metadata,
            occurred_at: event.occurred_at(),
            created_at: Utc::now(),
        })
    }

    /// Override the creation timestamp (used by stores with an injected clock).
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attach a store-assigned identifier.
    #[must_use]
    pub fn into_stored(self, id: MessageId) -> OutboxMessage {
        OutboxMessage {
            id,
            event_id: self.event_id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            routing_key: self.routing_key,
            payload: self.payload,
            metadata: self.metadata,
            occurred_at: self.occurred_at,
            created_at: self.created_at,
            published_at: None,
            next_retry_at: None,
            retry_count: 0,
            last_error: None,
            dead_lettered_at: None,
            dead_letter_reason: None,
            claimed_until: None,
        }
    }
}

/// A stored outbox message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Deduplication key from the originating event.
    pub event_id: Option<String>,
    /// Aggregate type.
    pub aggregate_type: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Event type.
    pub event_type: String,
    /// Routing key.
    pub routing_key: String,
    /// Serialized event body.
    pub payload: Vec<u8>,
    /// Serialized [`EventMetadata`], if any.
    pub metadata: Option<String>,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
    /// Set once delivered.
    pub published_at: Option<DateTime<Utc>>,
    /// Earliest time of the next attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Failed publish attempts.
    pub retry_count: u32,
    /// Error text of the last failed attempt.
    pub last_error: Option<String>,
    /// Set once dead-lettered.
    pub dead_lettered_at: Option<DateTime<Utc>>,
    /// Why the message was dead-lettered.
    pub dead_letter_reason: Option<String>,
    /// Claim lease held by a processor, if any.
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Derived lifecycle state.
    #[must_use]
    pub const fn state(&self) -> MessageState {
        if self.published_at.is_some() {
            MessageState::Published
        } else if self.dead_lettered_at.is_some() {
            MessageState::Dead
        } else if self.retry_count > 0 {
            MessageState::Failed {
                retry_count: self.retry_count,
            }
        } else {
            MessageState::Unpublished
        }
    }

    /// Whether the message has been delivered.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// Whether the message has been dead-lettered.
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Unpublished, not dead, and its retry time (if any) has arrived.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_published()
            && !self.is_dead()
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether another processor currently holds a claim on the message.
    #[must_use]
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }

    /// Parse the stored metadata; missing metadata is empty metadata.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the stored text is invalid.
    pub fn metadata(&self) -> Result<EventMetadata, EnvelopeError> {
        self.metadata
            .as_deref()
            .map_or_else(|| Ok(EventMetadata::default()), EventMetadata::from_json)
    }

    /// Build the wire envelope for this message.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the stored metadata is invalid.
    pub fn to_envelope(&self) -> Result<EventEnvelope, EnvelopeError> {
        Ok(EventEnvelope {
            event_id: self.event_id.clone().unwrap_or_default(),
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            event_type: self.event_type.clone(),
            routing_key: self.routing_key.clone(),
            occurred_at: self.occurred_at,
            payload: self.payload.clone(),
            metadata: self.metadata()?,
        })
    }

    /// Mark delivered.
    ///
    /// Idempotent: the first published timestamp is kept. Clears any dead-letter
    /// mark, which is how a replayed dead message recovers.
    pub fn apply_published(&mut self, at: DateTime<Utc>) {
        if self.published_at.is_none() {
            self.published_at = Some(at);
        }
        self.dead_lettered_at = None;
        self.dead_letter_reason = None;
        self.claimed_until = None;
    }

    /// Record a failed attempt and schedule the next one.
    ///
    /// No-op on a published message.
    pub fn apply_failed(&mut self, error: &str, next_retry_at: DateTime<Utc>) {
        if self.is_published() {
            return;
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.next_retry_at = Some(next_retry_at);
        self.claimed_until = None;
    }

    /// Dead-letter the message.
    ///
    /// No-op on a published message.
    pub fn apply_dead(&mut self, reason: &str, at: DateTime<Utc>) {
        if self.is_published() {
            return;
        }
        self.dead_lettered_at = Some(at);
        self.dead_letter_reason = Some(reason.to_string());
        self.last_error = Some(reason.to_string());
        self.claimed_until = None;
    }

    /// Return a dead message to the queue with a fresh retry budget.
    ///
    /// Returns `false` if the message was not dead.
    pub fn apply_replay(&mut self) -> bool {
        if !self.is_dead() {
            return false;
        }
        self.dead_lettered_at = None;
        self.dead_letter_reason = None;
        self.last_error = None;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.claimed_until = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stored() -> OutboxMessage {
        NewOutboxMessage {
            event_id: Some("evt-1".to_string()),
            aggregate_type: "meeting".to_string(),
            aggregate_id: "m-1".to_string(),
            event_type: "meeting.scheduled".to_string(),
            routing_key: "meeting.scheduled".to_string(),
            payload: br#"{"title":"standup"}"#.to_vec(),
            metadata: None,
            occurred_at: Utc::now(),
            created_at: Utc::now(),
        }
        .into_stored(MessageId::new(1))
    }

    #[test]
    fn new_message_is_unpublished_and_due() {
        let message = stored();
        assert_eq!(message.state(), MessageState::Unpublished);
        assert!(message.is_due(Utc::now()));
    }

    #[test]
    fn failed_message_waits_for_retry_time() {
        let mut message = stored();
        let now = Utc::now();
        message.apply_failed("broker down", now + Duration::seconds(5));

        assert_eq!(message.state(), MessageState::Failed { retry_count: 1 });
        assert_eq!(message.last_error.as_deref(), Some("broker down"));
        assert!(!message.is_due(now));
        assert!(message.is_due(now + Duration::seconds(5)));
    }

    #[test]
    fn publishing_clears_dead_letter_mark() {
        let mut message = stored();
        let now = Utc::now();
        message.apply_dead("exhausted", now);
        assert_eq!(message.state(), MessageState::Dead);
        assert!(!message.is_due(now));

        message.apply_published(now);
        assert_eq!(message.state(), MessageState::Published);
        assert!(message.dead_lettered_at.is_none());
        assert!(message.dead_letter_reason.is_none());
    }

    #[test]
    fn mark_published_is_idempotent() {
        let mut message = stored();
        let first = Utc::now();
        message.apply_published(first);
        message.apply_published(first + Duration::seconds(10));
        assert_eq!(message.published_at, Some(first));
    }

    #[test]
    fn published_message_ignores_failure_and_dead_transitions() {
        let mut message = stored();
        let now = Utc::now();
        message.apply_published(now);
        message.apply_failed("late failure", now);
        message.apply_dead("late dead", now);

        assert_eq!(message.retry_count, 0);
        assert!(message.is_published());
        assert!(!message.is_dead());
    }

    #[test]
    fn replay_resets_retry_budget() {
        let mut message = stored();
        let now = Utc::now();
        message.apply_failed("boom", now);
        message.apply_dead("boom", now);

        assert!(message.apply_replay());
        assert_eq!(message.state(), MessageState::Unpublished);
        assert!(message.is_due(now));
        assert!(!message.apply_replay());
    }

    #[test]
    fn claim_blocks_until_lease_expires() {
        let mut message = stored();
        let now = Utc::now();
        message.claimed_until = Some(now + Duration::seconds(30));

        assert!(message.is_claimed(now));
        assert!(!message.is_claimed(now + Duration::seconds(31)));
    }
}
