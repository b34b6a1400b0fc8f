//! Broker round trips against a RabbitMQ container.
//!
//! Docker must be running. Run with `cargo test -p outbox-rabbitmq -- --ignored`.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use outbox_core::consumer::ConsumerRegistry;
use outbox_core::event::EventEnvelope;
use outbox_core::publisher::{PublishError, Publisher};
use outbox_rabbitmq::{ConsumerError, RabbitMqConfig, RabbitMqConsumer, RabbitMqPublisher};
use outbox_testing::{RecordingHandler, TestEvent};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::rabbitmq::RabbitMq;
use tokio::sync::watch;

async fn setup_broker(queue: &str) -> (ContainerAsync<RabbitMq>, RabbitMqConfig) {
    let container = RabbitMq::default()
        .start()
        .await
        .expect("Failed to start rabbitmq container");
    let port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get rabbitmq port");

    let config = RabbitMqConfig::builder()
        .url(format!("amqp://127.0.0.1:{port}"))
        .exchange("outbox.test")
        .queue(queue)
        .build();
    (container, config)
}

fn encoded(routing_key: &str) -> (EventEnvelope, Vec<u8>) {
    let envelope = EventEnvelope::from_event(&TestEvent::new(routing_key)).expect("envelope");
    let bytes = envelope.encode().expect("encode");
    (envelope, bytes)
}

async fn wait_for(handler: &RecordingHandler, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while handler.count() < count {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("handler should receive deliveries");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_and_consume_round_trip() {
    let (_container, config) = setup_broker("round-trip").await;

    let registry = Arc::new(ConsumerRegistry::new());
    let consumer = RabbitMqConsumer::connect(config.clone(), registry)
        .await
        .expect("consumer");
    let handler = RecordingHandler::new("goals", &["wellness.goal.created"]);
    consumer
        .register(Arc::new(handler.clone()))
        .await
        .expect("register");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    consumer.start(shutdown_rx.clone()).await.expect("start");
    assert_eq!(
        consumer.start(shutdown_rx).await,
        Err(ConsumerError::AlreadyRunning)
    );

    let publisher = RabbitMqPublisher::connect(&config).await.expect("publisher");
    let (envelope, bytes) = encoded("wellness.goal.created");
    publisher
        .publish("wellness.goal.created", &bytes)
        .await
        .expect("publish");
    // Unbound routing keys are dropped by the exchange, not by the publisher
    let (_, other) = encoded("wellness.goal.deleted");
    publisher
        .publish("wellness.goal.deleted", &other)
        .await
        .expect("publish");

    wait_for(&handler, 1).await;
    assert_eq!(handler.received(), vec![envelope]);

    shutdown_tx.send(true).expect("shutdown");
    consumer.close().await.expect("close");
    consumer.close().await.expect("close twice");

    publisher.close().await.expect("close");
    publisher.close().await.expect("close twice");
    assert_eq!(
        publisher.publish("wellness.goal.created", &bytes).await,
        Err(PublishError::Closed)
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_failed_handler_is_redelivered_and_garbage_discarded() {
    let (_container, config) = setup_broker("redelivery").await;

    let registry = Arc::new(ConsumerRegistry::new());
    let failing = RecordingHandler::new("flaky", &["habit.logged"]).failing_with("db down");
    registry.register(Arc::new(failing.clone()));

    // Handlers registered before connect are bound at connect time
    let consumer = RabbitMqConsumer::connect(config.clone(), registry)
        .await
        .expect("consumer");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    consumer.start(shutdown_rx).await.expect("start");

    let publisher = RabbitMqPublisher::connect(&config).await.expect("publisher");
    publisher
        .publish("habit.logged", b"not an envelope")
        .await
        .expect("publish garbage");
    let (_, bytes) = encoded("habit.logged");
    publisher.publish("habit.logged", &bytes).await.expect("publish");

    // Requeued after each failure, so the same event arrives again
    wait_for(&failing, 2).await;
    let received = failing.received();
    assert_eq!(received[0].event_id, received[1].event_id);

    consumer.close().await.expect("close");
    publisher.close().await.expect("close");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_dropped_shutdown_sender_keeps_consumer_running() {
    let (_container, config) = setup_broker("shutdown").await;
    let consumer = RabbitMqConsumer::connect(config, Arc::new(ConsumerRegistry::new()))
        .await
        .expect("consumer");

    let (dropped_tx, dropped_rx) = watch::channel(false);
    consumer.start(dropped_rx).await.expect("start");
    drop(dropped_tx);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(consumer.is_running().await);

    consumer.close().await.expect("close");
    assert!(!consumer.is_running().await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_external_shutdown_ends_receive_loop() {
    let (_container, config) = setup_broker("external-shutdown").await;
    let consumer = RabbitMqConsumer::connect(config, Arc::new(ConsumerRegistry::new()))
        .await
        .expect("consumer");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    consumer.start(shutdown_rx).await.expect("start");
    shutdown_tx.send(true).expect("shutdown");

    tokio::time::timeout(Duration::from_secs(5), async {
        while consumer.is_running().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("receive loop should stop");

    consumer.close().await.expect("close");
}
