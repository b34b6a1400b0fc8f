//! Consumer-side routing: handlers, the registry and delivery decisions.
//!
//! Business modules subscribe to routing keys by registering an [`EventHandler`]
//! with a [`ConsumerRegistry`]. The registry is shared by the broker consumer and
//! the in-process publisher, so the same handlers run regardless of transport.
//!
//! # Dispatch
//!
//! Every handler registered for a routing key runs exactly once per dispatch, in
//! registration order, even when an earlier one fails. Failures are collected into
//! a [`DispatchError`]; [`DispatchError::last`] gives the most recent one.
//!
//! # Example
//!
//! ```ignore
//! let registry = ConsumerRegistry::new();
//! registry.register(Arc::new(StreakNotifier::new(mailer)));
//!
//! registry.dispatch(&envelope).await?;
//! ```

use crate::event::EventEnvelope;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Error returned by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error from any message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A subscriber to one or more routing keys.
///
/// Handlers must be idempotent: delivery is at-least-once and the same envelope may
/// arrive more than once. Use [`EventEnvelope::event_id`] to deduplicate.
pub trait EventHandler: Send + Sync {
    /// Routing keys this handler wants.
    fn event_types(&self) -> Vec<String>;

    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] if the event could not be handled.
    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

    /// Name used in logs and failure reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// One handler's failure during a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// The failing handler's name.
    pub handler: &'static str,
    /// What it returned.
    pub error: HandlerError,
}

/// One or more handlers failed during a dispatch.
///
/// Every registered handler still ran; this lists the ones that failed, in
/// dispatch order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} handler(s) failed for '{routing_key}', last: {}", .failures.len(), last_message(.failures))]
pub struct DispatchError {
    /// Routing key of the dispatched event.
    pub routing_key: String,
    /// Failures in dispatch order (never empty).
    pub failures: Vec<HandlerFailure>,
}

fn last_message(failures: &[HandlerFailure]) -> String {
    failures
        .last()
        .map(|failure| format!("{}: {}", failure.handler, failure.error))
        .unwrap_or_default()
}

impl DispatchError {
    /// The most recent handler error.
    #[must_use]
    pub fn last(&self) -> Option<&HandlerError> {
        self.failures.last().map(|failure| &failure.error)
    }
}

/// Routing key → handlers, in registration order.
///
/// Handlers are registered at startup and never removed. The handler list is
/// cloned out of the lock before any handler runs, so handlers may be slow without
/// blocking registration or concurrent dispatches.
#[derive(Default)]
pub struct ConsumerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl ConsumerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to every routing key it declares.
    ///
    /// Returns the routing keys it was registered for, so a broker consumer can bind
    /// its queue to each of them.
    pub fn register(&self, handler: Arc<dyn EventHandler>) -> Vec<String> {
        let routing_keys = handler.event_types();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for routing_key in &routing_keys {
            handlers
                .entry(routing_key.clone())
                .or_default()
                .push(Arc::clone(&handler));
        }

        tracing::debug!(
            handler = handler.name(),
            routing_keys = ?routing_keys,
            "Registered event handler"
        );

        routing_keys
    }

    /// Run every handler registered for the envelope's routing key.
    ///
    /// No handlers is a successful no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] listing every handler that failed.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Result<(), DispatchError> {
        let handlers = self.handlers_for(&envelope.routing_key);
        if handlers.is_empty() {
            tracing::trace!(routing_key = %envelope.routing_key, "No handlers registered");
            return Ok(());
        }

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(error) = handler.handle(envelope).await {
                tracing::warn!(
                    handler = handler.name(),
                    routing_key = %envelope.routing_key,
                    event_id = %envelope.event_id,
                    error = %error,
                    "Event handler failed"
                );
                failures.push(HandlerFailure {
                    handler: handler.name(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError {
                routing_key: envelope.routing_key.clone(),
                failures,
            })
        }
    }

    /// Routing keys with at least one handler, sorted.
    #[must_use]
    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Number of handlers registered for `routing_key`.
    #[must_use]
    pub fn handler_count(&self, routing_key: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(routing_key)
            .map_or(0, Vec::len)
    }

    fn handlers_for(&self, routing_key: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(routing_key)
            .cloned()
            .unwrap_or_default()
    }
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("routing_keys", &self.routing_keys())
            .finish()
    }
}

/// What a broker consumer should do with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handled; acknowledge.
    Ack,
    /// A handler failed; negative-acknowledge with requeue.
    Requeue,
    /// Malformed; acknowledge and drop, since redelivery cannot repair it.
    Discard,
}

/// Decode a raw delivery, dispatch it and decide how to settle it.
///
/// The envelope's routing key wins; `transport_routing_key` is used only when the
/// envelope's is empty.
pub async fn decide_delivery(
    registry: &ConsumerRegistry,
    bytes: &[u8],
    transport_routing_key: &str,
) -> DeliveryOutcome {
    let mut envelope = match EventEnvelope::decode(bytes) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::error!(
                routing_key = transport_routing_key,
                size = bytes.len(),
                error = %error,
                "Discarding undecodable delivery"
            );
            return DeliveryOutcome::Discard;
        }
    };

    if envelope.routing_key.is_empty() {
        envelope.routing_key = transport_routing_key.to_string();
    }

    match registry.dispatch(&envelope).await {
        Ok(()) => DeliveryOutcome::Ack,
        Err(error) => {
            tracing::warn!(
                routing_key = %envelope.routing_key,
                event_id = %envelope.event_id,
                failed_handlers = error.failures.len(),
                "Dispatch failed, requeueing delivery"
            );
            DeliveryOutcome::Requeue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use chrono::Utc;
    use std::sync::Mutex;

    struct Recorder {
        keys: Vec<String>,
        label: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl EventHandler for Recorder {
        fn event_types(&self) -> Vec<String> {
            self.keys.clone()
        }

        fn handle<'a>(
            &'a self,
            envelope: &'a EventEnvelope,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async move {
                self.log
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(format!("{}:{}", self.label, envelope.event_id));
                if self.fail {
                    Err(HandlerError::new(format!("{} failed", self.label)))
                } else {
                    Ok(())
                }
            })
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    fn recorder(
        label: &'static str,
        keys: &[&str],
        fail: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn EventHandler> {
        Arc::new(Recorder {
            keys: keys.iter().map(ToString::to_string).collect(),
            label,
            fail,
            log: Arc::clone(log),
        })
    }

    fn envelope(routing_key: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: "evt-1".to_string(),
            aggregate_id: "goal-1".to_string(),
            aggregate_type: "wellness_goal".to_string(),
            event_type: routing_key.to_string(),
            routing_key: routing_key.to_string(),
            occurred_at: Utc::now(),
            payload: b"{}".to_vec(),
            metadata: EventMetadata::new(),
        }
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[tokio::test]
    async fn dispatch_without_handlers_is_noop() {
        let registry = ConsumerRegistry::new();
        assert_eq!(registry.dispatch(&envelope("nobody.listens")).await, Ok(()));
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ConsumerRegistry::new();
        registry.register(recorder("first", &["goal.created"], false, &log));
        registry.register(recorder("second", &["goal.created", "goal.completed"], false, &log));

        assert_eq!(registry.dispatch(&envelope("goal.created")).await, Ok(()));
        assert_eq!(entries(&log), vec!["first:evt-1", "second:evt-1"]);
        assert_eq!(registry.handler_count("goal.created"), 2);
        assert_eq!(registry.handler_count("goal.completed"), 1);
        assert_eq!(registry.routing_keys(), vec!["goal.completed", "goal.created"]);
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn failing_handler_does_not_stop_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ConsumerRegistry::new();
        registry.register(recorder("a", &["habit.logged"], false, &log));
        registry.register(recorder("b", &["habit.logged"], true, &log));
        registry.register(recorder("c", &["habit.logged"], false, &log));

        let result = registry.dispatch(&envelope("habit.logged")).await;

        assert_eq!(entries(&log), vec!["a:evt-1", "b:evt-1", "c:evt-1"]);
        let error = result.expect_err("dispatch should report the failure");
        assert_eq!(error.failures.len(), 1);
        assert_eq!(error.failures[0].handler, "b");
        assert_eq!(error.last(), Some(&HandlerError::new("b failed")));
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn last_reports_most_recent_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ConsumerRegistry::new();
        registry.register(recorder("early", &["k"], true, &log));
        registry.register(recorder("late", &["k"], true, &log));

        let error = registry
            .dispatch(&envelope("k"))
            .await
            .expect_err("dispatch should fail");
        assert_eq!(error.failures.len(), 2);
        assert_eq!(error.last(), Some(&HandlerError::new("late failed")));
        assert!(error.to_string().contains("late failed"));
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn delivery_outcomes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ConsumerRegistry::new();
        registry.register(recorder("ok", &["goal.created"], false, &log));
        registry.register(recorder("bad", &["goal.failed"], true, &log));

        let good = envelope("goal.created").encode().expect("encode");
        let bad = envelope("goal.failed").encode().expect("encode");

        assert_eq!(decide_delivery(&registry, &good, "ignored").await, DeliveryOutcome::Ack);
        assert_eq!(decide_delivery(&registry, &bad, "ignored").await, DeliveryOutcome::Requeue);
        assert_eq!(
            decide_delivery(&registry, b"garbage", "goal.created").await,
            DeliveryOutcome::Discard
        );
    }

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn empty_envelope_key_falls_back_to_transport_key() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ConsumerRegistry::new();
        registry.register(recorder("fallback", &["goal.created"], false, &log));

        let bytes = envelope("").encode().expect("encode");
        assert_eq!(
            decide_delivery(&registry, &bytes, "goal.created").await,
            DeliveryOutcome::Ack
        );
        assert_eq!(entries(&log), vec!["fallback:evt-1"]);
    }
}
