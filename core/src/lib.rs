//! # Outbox Core
//!
//! Core traits and types for the transactional outbox.
//!
//! A service that mutates transactional state and must also emit domain events
//! records those events as [`message::NewOutboxMessage`]s in the same database
//! transaction as the state change. A separate processor later delivers them to a
//! broker through a [`publisher::Publisher`], and the consuming side routes them
//! to handlers through a [`consumer::ConsumerRegistry`].
//!
//! ## Core Concepts
//!
//! - **Domain event**: anything implementing [`event::DomainEvent`]; the outbox never
//!   looks inside it beyond the identity fields
//! - **Message**: one event awaiting durable delivery, with its retry state on the row
//! - **Repository**: durable message store ([`repository::OutboxRepository`])
//! - **Publisher**: transport capability with exactly two operations, `publish` and `close`
//! - **Registry**: routing key → ordered handlers
//!
//! ## Delivery Semantics
//!
//! Delivery is at-least-once. Handlers must be idempotent; the event identifier
//! carried in every [`event::EventEnvelope`] is the deduplication key.
//!
//! ## Example
//!
//! ```ignore
//! use outbox_core::repository::enqueue;
//!
//! // Inside the business transaction
//! let ids = enqueue(&repository, &meeting.take_events()).await?;
//! ```

pub mod consumer;
pub mod event;
pub mod message;
pub mod publisher;
pub mod repository;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Environment module - injected dependencies
///
/// Time is the only ambient dependency the outbox needs. Every component that
/// decides whether a message is due takes a [`Clock`](environment::Clock) so tests
/// can drive time explicitly.
pub mod environment {
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use outbox_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Add a std [`Duration`] to a timestamp, saturating at the far future.
    ///
    /// # Examples
    ///
    /// ```
    /// use outbox_core::environment::add_duration;
    /// use chrono::Utc;
    /// use std::time::Duration;
    ///
    /// let now = Utc::now();
    /// assert_eq!(add_duration(now, Duration::from_secs(1)) - now, chrono::Duration::seconds(1));
    /// ```
    #[must_use]
    pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::environment::add_duration;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[test]
    #[allow(clippy::expect_used)]
    fn add_duration_saturates_instead_of_overflowing() {
        let now = Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp");

        assert_eq!(add_duration(now, Duration::MAX), chrono::DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            add_duration(now, Duration::from_millis(1500)) - now,
            chrono::Duration::milliseconds(1500)
        );
    }
}
