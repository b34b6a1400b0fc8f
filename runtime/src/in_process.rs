//! Publisher that delivers straight into a local [`ConsumerRegistry`].
//!
//! Used when the service runs without a broker. Publishing decodes the envelope
//! and dispatches it synchronously; handler and decode errors are logged and
//! swallowed so a buggy local handler never dead-letters an outbox message.

use outbox_core::consumer::ConsumerRegistry;
use outbox_core::event::EventEnvelope;
use outbox_core::publisher::{PublishError, Publisher};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-process transport.
///
/// `close` is idempotent; publishing after it fails with [`PublishError::Closed`].
#[derive(Debug)]
pub struct InProcessPublisher {
    registry: Arc<ConsumerRegistry>,
    closed: AtomicBool,
}

impl InProcessPublisher {
    /// Dispatch into `registry`.
    #[must_use]
    pub const fn new(registry: Arc<ConsumerRegistry>) -> Self {
        Self {
            registry,
            closed: AtomicBool::new(false),
        }
    }

    /// The registry this publisher dispatches into.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }
}

impl Publisher for InProcessPublisher {
    fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        let routing_key = routing_key.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PublishError::Closed);
            }

            let mut envelope = match EventEnvelope::decode(&payload) {
                Ok(envelope) => envelope,
                Err(error) => {
                    tracing::error!(
                        routing_key = %routing_key,
                        error = %error,
                        "Dropping undecodable in-process message"
                    );
                    return Ok(());
                }
            };
            if envelope.routing_key.is_empty() {
                envelope.routing_key = routing_key;
            }

            if let Err(error) = self.registry.dispatch(&envelope).await {
                tracing::warn!(
                    routing_key = %envelope.routing_key,
                    event_id = %envelope.event_id,
                    error = %error,
                    "In-process handler failed; message still counts as delivered"
                );
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + '_>> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                tracing::debug!("In-process publisher closed");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::processor::{OutboxProcessor, ProcessorConfig};
    use outbox_core::repository::OutboxRepository;
    use outbox_testing::{InMemoryOutboxRepository, RecordingHandler, TestEvent, message_for};

    #[tokio::test]
    async fn test_publish_dispatches_to_handlers() {
        let registry = Arc::new(ConsumerRegistry::new());
        let handler = RecordingHandler::new("goals", &["goal.created"]);
        registry.register(Arc::new(handler.clone()));

        let publisher = InProcessPublisher::new(Arc::clone(&registry));
        let envelope = EventEnvelope::from_event(&TestEvent::new("goal.created")).expect("envelope");
        let bytes = envelope.encode().expect("encode");

        publisher.publish("goal.created", &bytes).await.expect("publish");

        assert_eq!(handler.received(), vec![envelope]);
    }

    #[tokio::test]
    async fn test_handler_errors_are_swallowed() {
        let registry = Arc::new(ConsumerRegistry::new());
        let failing = RecordingHandler::new("broken", &["habit.logged"]).failing_with("db down");
        let healthy = RecordingHandler::new("healthy", &["habit.logged"]);
        registry.register(Arc::new(failing.clone()));
        registry.register(Arc::new(healthy.clone()));

        let publisher = InProcessPublisher::new(registry);
        let bytes = EventEnvelope::from_event(&TestEvent::new("habit.logged"))
            .and_then(|envelope| envelope.encode())
            .expect("encode");

        assert_eq!(publisher.publish("habit.logged", &bytes).await, Ok(()));
        assert_eq!(failing.count(), 1);
        assert_eq!(healthy.count(), 1);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_swallowed() {
        let publisher = InProcessPublisher::new(Arc::new(ConsumerRegistry::new()));
        assert_eq!(publisher.publish("any", b"not an envelope").await, Ok(()));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let publisher = InProcessPublisher::new(Arc::new(ConsumerRegistry::new()));
        assert_eq!(publisher.close().await, Ok(()));
        assert_eq!(publisher.close().await, Ok(()));
        assert_eq!(publisher.publish("any", b"").await, Err(PublishError::Closed));
    }

    #[tokio::test]
    async fn test_processor_delivers_through_registry() {
        let registry = Arc::new(ConsumerRegistry::new());
        let handler = RecordingHandler::new("meetings", &["meeting.scheduled"]).failing_with("boom");
        registry.register(Arc::new(handler.clone()));

        let repository = Arc::new(InMemoryOutboxRepository::new());
        let id = repository
            .save(message_for("meeting.scheduled"))
            .await
            .expect("save");

        let processor = OutboxProcessor::new(
            repository.clone(),
            Arc::new(InProcessPublisher::new(registry)),
            ProcessorConfig::default().with_max_retries(1),
        );
        let report = processor.process_batch().await.expect("batch");

        // A failing local handler never dead-letters the message.
        assert_eq!(report.published, 1);
        assert_eq!(report.dead, 0);
        assert_eq!(handler.count(), 1);

        let stored = repository.get(id).await.expect("get").expect("exists");
        assert!(stored.is_published());
        assert_eq!(Some(handler.received()[0].event_id.clone()), stored.event_id);
    }
}
