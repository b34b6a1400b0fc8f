//! # Outbox Testing
//!
//! Testing utilities for the transactional outbox.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`MockClock`])
//! - [`InMemoryOutboxRepository`]: a complete, clock-driven repository with failure injection
//! - Transport doubles: [`RecordingPublisher`], [`FailingPublisher`], [`RecordingHandler`]
//! - Sample events and messages ([`TestEvent`], [`message_for`])
//! - proptest strategies for messages
//!
//! ## Example
//!
//! ```ignore
//! use outbox_testing::{InMemoryOutboxRepository, MockClock, RecordingPublisher, message_for};
//!
//! #[tokio::test]
//! async fn publishes_due_messages() {
//!     let clock = Arc::new(MockClock::new(Utc::now()));
//!     let repository = Arc::new(InMemoryOutboxRepository::with_clock(clock.clone()));
//!     repository.save(message_for("goal.created")).await?;
//!
//!     let processor = OutboxProcessor::with_clock(repository, publisher, config, clock);
//!     processor.process_batch().await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use outbox_core::environment::Clock;
use outbox_core::event::{DomainEvent, EventMetadata};
use outbox_core::message::NewOutboxMessage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod outbox_mocks;
pub mod transport_mocks;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{PoisonError, RwLock};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use outbox_testing::mocks::FixedClock;
    /// use outbox_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Shared between a repository and a processor so retry schedules can be
    /// stepped through without sleeping.
    ///
    /// # Example
    ///
    /// ```
    /// use outbox_testing::mocks::MockClock;
    /// use outbox_core::environment::Clock;
    /// use chrono::Utc;
    /// use std::time::Duration;
    ///
    /// let clock = MockClock::new(Utc::now());
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(5));
    /// assert_eq!(clock.now() - before, chrono::Duration::seconds(5));
    /// ```
    #[derive(Debug)]
    pub struct MockClock {
        time: RwLock<DateTime<Utc>>,
    }

    impl MockClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: RwLock::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time = outbox_core::environment::add_duration(*time, by);
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// proptest strategies for outbox types.
pub mod properties {
    use proptest::prelude::*;

    /// Dotted routing keys such as `"goal.created"`.
    pub fn routing_key() -> impl Strategy<Value = String> {
        ("[a-z]{1,8}", "[a-z]{1,8}").prop_map(|(aggregate, verb)| format!("{aggregate}.{verb}"))
    }

    /// Retry offsets in seconds relative to "now": negative is due, positive is not.
    pub fn retry_offset_secs() -> impl Strategy<Value = Option<i64>> {
        prop::option::of(-3_600i64..3_600)
    }
}

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init()
        .ok();
}

/// A sample domain event with a JSON body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEvent {
    /// Event identifier.
    pub event_id: String,
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Routing key.
    pub routing_key: String,
    /// Free-form body.
    pub body: String,
    /// Occurrence time.
    pub occurred_at: DateTime<Utc>,
}

static NEXT_EVENT: AtomicU64 = AtomicU64::new(1);

impl TestEvent {
    /// Create an event with a unique identifier.
    #[must_use]
    pub fn new(routing_key: &str) -> Self {
        let n = NEXT_EVENT.fetch_add(1, Ordering::Relaxed);
        Self {
            event_id: format!("evt-{n}"),
            aggregate_id: format!("agg-{n}"),
            routing_key: routing_key.to_string(),
            body: format!("body {n}"),
            occurred_at: Utc::now(),
        }
    }
}

impl DomainEvent for TestEvent {
    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn aggregate_type(&self) -> &str {
        "test_aggregate"
    }

    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn metadata(&self) -> EventMetadata {
        EventMetadata::new().with_correlation_id(format!("corr-{}", self.event_id))
    }
}

/// An unsaved message wrapping a fresh [`TestEvent`].
///
/// # Panics
///
/// Panics if the event cannot be serialized, which a `TestEvent` always can.
#[must_use]
#[allow(clippy::expect_used)]
pub fn message_for(routing_key: &str) -> NewOutboxMessage {
    NewOutboxMessage::from_event(&TestEvent::new(routing_key))
        .expect("test events always serialize")
}

pub use mocks::{FixedClock, MockClock, test_clock};
pub use outbox_mocks::InMemoryOutboxRepository;
pub use transport_mocks::{FailingPublisher, RecordingHandler, RecordingPublisher};
