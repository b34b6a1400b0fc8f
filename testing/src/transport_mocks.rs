//! Publisher and handler doubles.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use outbox_core::consumer::{EventHandler, HandlerError};
use outbox_core::event::EventEnvelope;
use outbox_core::publisher::{PublishError, Publisher};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Publisher that records every accepted message.
///
/// Publishing after [`close`](Publisher::close) fails with [`PublishError::Closed`].
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingPublisher {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(routing_key, payload)` pairs in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// Published payloads decoded as envelopes; undecodable payloads are skipped.
    #[must_use]
    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, payload)| EventEnvelope::decode(payload).ok())
            .collect()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Publisher for RecordingPublisher {
    fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        let record = (routing_key.to_string(), payload.to_vec());
        Box::pin(async move {
            if self.is_closed() {
                return Err(PublishError::Closed);
            }
            self.published.lock().unwrap().push(record);
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Debug, Clone)]
enum FailureMode {
    Always,
    Routes(HashSet<String>),
}

/// Publisher that fails on demand and counts attempts.
///
/// - [`FailingPublisher::always`] fails every publish with [`PublishError::Connection`]
/// - [`FailingPublisher::for_routes`] fails only the listed routing keys with
///   [`PublishError::Rejected`] and accepts the rest
#[derive(Debug, Clone)]
pub struct FailingPublisher {
    mode: FailureMode,
    message: String,
    attempts: Arc<AtomicUsize>,
}

impl FailingPublisher {
    /// Fail every publish.
    #[must_use]
    pub fn always(message: &str) -> Self {
        Self {
            mode: FailureMode::Always,
            message: message.to_string(),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail only publishes to `routing_keys`.
    #[must_use]
    pub fn for_routes(routing_keys: &[&str], message: &str) -> Self {
        Self {
            mode: FailureMode::Routes(routing_keys.iter().map(ToString::to_string).collect()),
            message: message.to_string(),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish attempts so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn outcome(&self, routing_key: &str) -> Result<(), PublishError> {
        match &self.mode {
            FailureMode::Always => Err(PublishError::Connection(self.message.clone())),
            FailureMode::Routes(keys) if keys.contains(routing_key) => {
                Err(PublishError::Rejected(self.message.clone()))
            }
            FailureMode::Routes(_) => Ok(()),
        }
    }
}

impl Publisher for FailingPublisher {
    fn publish(
        &self,
        routing_key: &str,
        _payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcome(routing_key);
        Box::pin(async move { outcome })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Handler that records every envelope it receives.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    name: &'static str,
    routing_keys: Vec<String>,
    failure: Option<String>,
    received: Arc<Mutex<Vec<EventEnvelope>>>,
}

impl RecordingHandler {
    /// A handler that accepts every event on `routing_keys`.
    #[must_use]
    pub fn new(name: &'static str, routing_keys: &[&str]) -> Self {
        Self {
            name,
            routing_keys: routing_keys.iter().map(ToString::to_string).collect(),
            failure: None,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make every `handle` call fail with `message` (after recording the envelope).
    #[must_use]
    pub fn failing_with(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Envelopes received, in order.
    #[must_use]
    pub fn received(&self) -> Vec<EventEnvelope> {
        self.received.lock().unwrap().clone()
    }

    /// Number of envelopes received.
    #[must_use]
    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl EventHandler for RecordingHandler {
    fn event_types(&self) -> Vec<String> {
        self.routing_keys.clone()
    }

    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            self.received.lock().unwrap().push(envelope.clone());
            match &self.failure {
                Some(message) => Err(HandlerError::new(message.clone())),
                None => Ok(()),
            }
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
