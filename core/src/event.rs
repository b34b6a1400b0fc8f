//! Domain event capability and the broker wire envelope.
//!
//! The outbox does not understand business aggregates. Anything that implements
//! [`DomainEvent`] can be enqueued: the trait exposes only the identity and routing
//! fields the outbox needs, and the event itself is serialized as an opaque payload.
//!
//! # Formats
//!
//! - **Payload**: the original event as JSON (`serde_json`), so the stored row stays
//!   readable and consumers in other services can decode it
//! - **Metadata**: [`EventMetadata`] as JSON text
//! - **Wire envelope**: [`EventEnvelope`] as `bincode` bytes
//!
//! # Example
//!
//! ```
//! use outbox_core::event::{DomainEvent, EventMetadata};
//! use chrono::{DateTime, Utc};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct GoalCreated {
//!     event_id: String,
//!     goal_id: String,
//!     title: String,
//!     occurred_at: DateTime<Utc>,
//! }
//!
//! impl DomainEvent for GoalCreated {
//!     fn event_id(&self) -> &str { &self.event_id }
//!     fn aggregate_id(&self) -> &str { &self.goal_id }
//!     fn aggregate_type(&self) -> &str { "wellness_goal" }
//!     fn routing_key(&self) -> &str { "wellness.goal.created" }
//!     fn occurred_at(&self) -> DateTime<Utc> { self.occurred_at }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error types for payload, metadata and envelope encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Failed to serialize a value.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize a value.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// Correlation context carried with every event.
///
/// - `user_id`: the user who triggered the change
/// - `correlation_id`: links every event of one logical operation
/// - `causation_id`: the event or command that directly caused this one
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// The user who triggered this event.
    pub user_id: Option<String>,
    /// Links related events across aggregates.
    pub correlation_id: Option<String>,
    /// Links cause-and-effect events.
    pub causation_id: Option<String>,
}

impl EventMetadata {
    /// Create empty metadata.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            user_id: None,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Set the user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// True when no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.correlation_id.is_none() && self.causation_id.is_none()
    }

    /// Serialize to the JSON text stored in the metadata column.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SerializationError`] if serialization fails.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::SerializationError(e.to_string()))
    }

    /// Parse the JSON text stored in the metadata column.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the text is not valid metadata.
    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(json).map_err(|e| EnvelopeError::DeserializationError(e.to_string()))
    }
}

/// An event produced by a business aggregate that can be enqueued in the outbox.
///
/// Implementors only describe identity and routing; the event body is serialized
/// with `serde_json` into the message payload.
///
/// # Routing Keys
///
/// Routing keys are exact-match strings such as `"meeting.scheduled"`. They select
/// handlers in the in-process registry and the binding on the broker's topic exchange.
pub trait DomainEvent: Serialize + Send + Sync {
    /// Unique event identifier; consumers use it to deduplicate redeliveries.
    fn event_id(&self) -> &str;

    /// Identifier of the aggregate instance that produced the event.
    fn aggregate_id(&self) -> &str;

    /// Aggregate type name (e.g. `"meeting"`).
    fn aggregate_type(&self) -> &str;

    /// Routing key used for delivery.
    fn routing_key(&self) -> &str;

    /// Event type name. Defaults to the routing key.
    fn event_type(&self) -> &str {
        self.routing_key()
    }

    /// When the event happened.
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Correlation context. Defaults to empty metadata.
    fn metadata(&self) -> EventMetadata {
        EventMetadata::default()
    }

    /// Serialize the event body to the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SerializationError`] if the event cannot be serialized.
    fn to_payload(&self) -> Result<Vec<u8>, EnvelopeError>
    where
        Self: Sized,
    {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::SerializationError(e.to_string()))
    }
}

/// The record sent over the broker.
///
/// The routing key travels both here and in the transport's own routing-key
/// field; consumers prefer this one and fall back to the transport's only when
/// it is empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event identifier (deduplication key).
    pub event_id: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Aggregate type.
    pub aggregate_type: String,
    /// Event type.
    pub event_type: String,
    /// Routing key.
    pub routing_key: String,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// The original event, serialized as JSON.
    pub payload: Vec<u8>,
    /// Correlation context.
    pub metadata: EventMetadata,
}

impl EventEnvelope {
    /// Build an envelope directly from a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SerializationError`] if the event cannot be serialized.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, EnvelopeError> {
        Ok(Self {
            event_id: event.event_id().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            aggregate_type: event.aggregate_type().to_string(),
            event_type: event.event_type().to_string(),
            routing_key: event.routing_key().to_string(),
            occurred_at: event.occurred_at(),
            payload: event.to_payload()?,
            metadata: event.metadata(),
        })
    }

    /// Encode the envelope to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::SerializationError`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        bincode::serialize(self).map_err(|e| EnvelopeError::SerializationError(e.to_string()))
    }

    /// Decode an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the bytes are not an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        bincode::deserialize(bytes).map_err(|e| EnvelopeError::DeserializationError(e.to_string()))
    }

    /// Deserialize the payload into a concrete event type.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the payload does not match `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| EnvelopeError::DeserializationError(e.to_string()))
    }

    /// Deserialize the payload into a generic JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeserializationError`] if the payload is not JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, EnvelopeError> {
        self.decode_payload()
    }
}

impl std::fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EventEnvelope {{ id: {}, routing_key: {}, size: {} bytes }}",
            self.event_id,
            self.routing_key,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct HabitLogged {
        event_id: String,
        habit_id: String,
        streak: u32,
        occurred_at: DateTime<Utc>,
    }

    impl DomainEvent for HabitLogged {
        fn event_id(&self) -> &str {
            &self.event_id
        }
        fn aggregate_id(&self) -> &str {
            &self.habit_id
        }
        fn aggregate_type(&self) -> &str {
            "habit"
        }
        fn routing_key(&self) -> &str {
            "habit.logged"
        }
        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
        fn metadata(&self) -> EventMetadata {
            EventMetadata::new().with_user_id("user-7").with_correlation_id("req-1")
        }
    }

    fn sample() -> HabitLogged {
        HabitLogged {
            event_id: "evt-1".to_string(),
            habit_id: "habit-42".to_string(),
            streak: 3,
            occurred_at: Utc
                .with_ymd_and_hms(2025, 1, 1, 8, 30, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    #[test]
    fn event_type_defaults_to_routing_key() {
        assert_eq!(sample().event_type(), "habit.logged");
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if encoding fails
    fn envelope_carries_identity_and_payload() {
        let event = sample();
        let envelope = EventEnvelope::from_event(&event).expect("envelope should build");

        assert_eq!(envelope.event_id, "evt-1");
        assert_eq!(envelope.aggregate_id, "habit-42");
        assert_eq!(envelope.aggregate_type, "habit");
        assert_eq!(envelope.metadata.user_id.as_deref(), Some("user-7"));

        let wire = envelope.encode().expect("encode should succeed");
        let decoded = EventEnvelope::decode(&wire).expect("decode should succeed");
        assert_eq!(decoded, envelope);

        let original: HabitLogged = decoded.decode_payload().expect("payload should decode");
        assert_eq!(original, event);
    }

    #[test]
    fn decode_rejects_garbage() {
        let result = EventEnvelope::decode(b"not an envelope");
        assert!(matches!(result, Err(EnvelopeError::DeserializationError(_))));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn metadata_json_roundtrip() {
        let metadata = EventMetadata::new()
            .with_correlation_id("corr-1")
            .with_causation_id("evt-0");

        let json = metadata.to_json().expect("serialize");
        assert_eq!(EventMetadata::from_json(&json).expect("parse"), metadata);
        assert!(!metadata.is_empty());
        assert!(EventMetadata::new().is_empty());
    }
}
