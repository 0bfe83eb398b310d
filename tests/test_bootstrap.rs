//! Application bootstrap tests
//!
//! Startup ordering, smoke test message, signal-driven shutdown and the
//! shutdown grace period, all against the in-memory broker.


use kafka_keeper::bootstrap::Application;
use kafka_keeper::error::{ConnectError, KeeperError, ShutdownError};
use kafka_keeper::lifecycle::{ChannelHandler, ConnectionState, LoggingHandler};
use kafka_keeper::testing::mocks::{
    MockAdminTransport, MockBroker, MockConsumerTransport, MockProducerTransport,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::test_config;
use tokio::sync::oneshot;

struct Harness {
    app: Application<MockProducerTransport, MockConsumerTransport>,
    broker: Arc<MockBroker>,
    producer: MockProducerTransport,
    consumer: MockConsumerTransport,
}

fn harness(config: kafka_keeper::KeeperConfig) -> Harness {
    let broker = MockBroker::new();
    let producer = MockProducerTransport::new(Arc::clone(&broker));
    let consumer = MockConsumerTransport::new(Arc::clone(&broker));
    let app = Application::new(
        config,
        producer.clone(),
        consumer.clone(),
        MockAdminTransport::new(Arc::clone(&broker)),
        Arc::new(LoggingHandler),
    )
    .unwrap();

    Harness {
        app,
        broker,
        producer,
        consumer,
    }
}

#[tokio::test]
async fn test_smoke_message_round_trips_to_consumer() {
    // Arrange
    let broker = MockBroker::new();
    let (handler, mut received) = ChannelHandler::channel(8);
    let app = Application::new(
        test_config(),
        MockProducerTransport::new(Arc::clone(&broker)),
        MockConsumerTransport::new(Arc::clone(&broker)),
        MockAdminTransport::new(Arc::clone(&broker)),
        Arc::new(handler),
    )
    .unwrap();

    // Act
    app.start().await.unwrap();

    // Assert
    let message = tokio::time::timeout(Duration::from_secs(2), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "test-topic");
    assert_eq!(message.text(), "Hello Kafka!");

    app.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_production_environment_skips_smoke_message() {
    let mut config = test_config();
    config.runtime.environment = "production".to_string();
    let h = harness(config);

    h.app.start().await.unwrap();

    assert!(h.broker.messages("test-topic").is_empty());
    assert_eq!(h.producer.send_attempts(), 0);
    h.app.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_run_until_signal_shuts_both_managers_down() {
    // Arrange
    let h = harness(test_config());
    let (signal_tx, signal_rx) = oneshot::channel::<()>();

    // Act: signal once startup has completed
    let run = h.app.run_until(async {
        let _ = signal_rx.await;
    });
    let trigger = async {
        let producer = h.app.producer();
        let consumer = h.app.consumer();
        test_helpers::wait_until(
            || producer.is_connected() && consumer.is_running(),
            Duration::from_secs(2),
        )
        .await;
        let _ = signal_tx.send(());
    };
    let (result, ()) = tokio::join!(run, trigger);

    // Assert
    assert!(result.is_ok());
    assert_eq!(h.app.producer().state(), ConnectionState::Disconnected);
    assert_eq!(h.app.consumer().state(), ConnectionState::Disconnected);
    assert_eq!(h.producer.disconnect_count(), 1);
    assert_eq!(h.consumer.disconnect_count(), 1);
}

#[tokio::test]
async fn test_signal_during_startup_exits_cleanly() {
    // Arrange: the broker is down, so consumer startup would retry forever
    let h = harness(test_config());
    h.broker.set_available(false);

    // Act
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.app
            .run_until(tokio::time::sleep(Duration::from_millis(100))),
    )
    .await
    .expect("signal must end startup");

    // Assert
    assert!(result.is_ok());
    assert!(h.consumer.connect_count() >= 1);
    assert_eq!(h.app.consumer().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_bounded_startup_failure_is_returned() {
    let mut config = test_config();
    config.consumer.startup_max_attempts = Some(2);
    let h = harness(config);
    h.broker.set_available(false);

    let result = h.app.run_until(std::future::pending::<()>()).await;

    assert!(matches!(
        result,
        Err(KeeperError::Connect(ConnectError::AttemptsExhausted { attempts: 2, .. }))
    ));
    assert_eq!(h.producer.connect_count(), 0);
}

#[tokio::test]
async fn test_shutdown_reports_elapsed_grace_period() {
    // Arrange: a producer connect that outlives the grace period holds the
    // producer lock, so shutdown cannot finish in time
    let h = harness(test_config());
    h.producer.set_connect_delay(Duration::from_millis(500));

    let app = &h.app;
    let connecting = async {
        let _ = app.producer().init().await;
    };
    let stopping = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        app.shutdown(Duration::from_millis(50)).await
    };

    // Act
    let ((), result) = tokio::join!(connecting, stopping);

    // Assert
    assert!(matches!(result, Err(ShutdownError::GracePeriodElapsed(_))));
}
