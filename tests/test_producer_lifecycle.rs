//! Producer lifecycle tests
//!
//! Tests the observable behaviour of the producer manager against the
//! in-memory broker:
//! - Connections are opened once and reused
//! - A failed send reconnects and retries exactly once
//! - Shutdown interrupts the retry delay and never fails


use kafka_keeper::error::SendError;
use kafka_keeper::lifecycle::ConnectionState;
use kafka_keeper::message::OutboundMessage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use test_helpers::producer_fixture;

#[tokio::test]
async fn test_repeated_init_opens_one_connection() {
    // Arrange
    let (producer, transport, _) = producer_fixture(Duration::from_millis(10));

    // Act
    producer.init().await.unwrap();
    producer.init().await.unwrap();

    // Assert
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(producer.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_concurrent_init_opens_one_connection() {
    // Arrange: slow connect so every caller overlaps the first one
    let (producer, transport, _) = producer_fixture(Duration::from_millis(10));
    transport.set_connect_delay(Duration::from_millis(50));

    // Act
    let results = futures::future::join_all((0..5).map(|_| producer.init())).await;

    // Assert
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_send_connects_on_demand() {
    let (producer, transport, broker) = producer_fixture(Duration::from_millis(10));

    let receipt = producer
        .send(&OutboundMessage::text("hello"), None)
        .await
        .unwrap();

    assert_eq!(transport.connect_count(), 1);
    assert_eq!(receipt.topic, "test-topic");
    assert_eq!(receipt.offset, 0);
    assert_eq!(broker.messages("test-topic").len(), 1);
}

#[tokio::test]
async fn test_explicit_topic_overrides_message_and_default() {
    let (producer, _, broker) = producer_fixture(Duration::from_millis(10));
    let message = OutboundMessage::text("routed").with_topic("from-message");

    producer.send(&message, Some("orders")).await.unwrap();
    producer.send(&message, None).await.unwrap();

    assert_eq!(broker.messages("orders").len(), 1);
    assert_eq!(broker.messages("from-message").len(), 1);
    assert!(broker.messages("test-topic").is_empty());
}

#[tokio::test]
async fn test_failed_send_reconnects_and_retries_once() {
    // Arrange
    let (producer, transport, broker) = producer_fixture(Duration::from_millis(10));
    producer.init().await.unwrap();
    transport.fail_next_sends(1);

    // Act
    let receipt = producer
        .send(&OutboundMessage::text("retry me"), None)
        .await
        .unwrap();

    // Assert: one failed attempt, one successful retry on a fresh connection
    assert_eq!(transport.send_attempts(), 2);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(transport.disconnect_count(), 1);
    assert_eq!(receipt.offset, 0);
    assert_eq!(broker.messages("test-topic").len(), 1);
    assert!(producer.is_connected());
}

#[tokio::test]
async fn test_retry_waits_for_retry_delay() {
    let (producer, transport, _) = producer_fixture(Duration::from_millis(100));
    producer.init().await.unwrap();
    transport.fail_next_sends(1);

    let start = Instant::now();
    producer
        .send(&OutboundMessage::text("slow retry"), None)
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_second_failure_surfaces_delivery_error() {
    // Arrange
    let (producer, transport, broker) = producer_fixture(Duration::from_millis(10));
    transport.fail_next_sends(2);

    // Act
    let err = producer
        .send(&OutboundMessage::text("doomed"), None)
        .await
        .unwrap_err();

    // Assert: exactly two attempts, then the error reaches the caller
    assert!(matches!(err, SendError::Delivery { attempts: 2, .. }));
    assert_eq!(err.attempts(), 2);
    assert_eq!(transport.send_attempts(), 2);
    assert!(broker.messages("test-topic").is_empty());
    assert!(!producer.is_connected());
}

#[tokio::test]
async fn test_reconnect_failure_surfaces_reconnect_error() {
    let (producer, transport, _) = producer_fixture(Duration::from_millis(10));
    producer.init().await.unwrap();
    transport.fail_next_sends(1);
    transport.fail_next_connects(1);

    let err = producer
        .send(&OutboundMessage::text("no way back"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::Reconnect { .. }));
    assert_eq!(err.attempts(), 1);
    assert_eq!(transport.send_attempts(), 1);
    assert_eq!(producer.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unreachable_broker_surfaces_not_connected() {
    let (producer, transport, broker) = producer_fixture(Duration::from_millis(10));
    broker.set_available(false);

    let err = producer
        .send(&OutboundMessage::text("nobody home"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::NotConnected(_)));
    assert_eq!(transport.send_attempts(), 0);
}

#[tokio::test]
async fn test_invalid_topic_rejected_before_connecting() {
    let (producer, transport, _) = producer_fixture(Duration::from_millis(10));

    let err = producer
        .send(&OutboundMessage::text("x"), Some("not a topic"))
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::InvalidTopic(_)));
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_retry_delay() {
    // Arrange: a retry delay far longer than the test is willing to wait
    let (producer, transport, _) = producer_fixture(Duration::from_secs(30));
    let producer = Arc::new(producer);
    producer.init().await.unwrap();
    transport.fail_next_sends(1);

    let sender = Arc::clone(&producer);
    let send = tokio::spawn(async move {
        sender
            .send(&OutboundMessage::text("interrupted"), None)
            .await
    });

    // Act
    tokio::time::sleep(Duration::from_millis(50)).await;
    producer.shutdown().await;

    // Assert: the pending send gives up after its single attempt
    let result = tokio::time::timeout(Duration::from_secs(2), send)
        .await
        .expect("send should return promptly after shutdown")
        .unwrap();
    assert!(matches!(result, Err(SendError::Delivery { attempts: 1, .. })));
    assert_eq!(transport.send_attempts(), 1);
    assert_eq!(producer.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_with_send_in_flight_completes() {
    let (producer, transport, _) = producer_fixture(Duration::from_millis(10));
    let producer = Arc::new(producer);
    producer.init().await.unwrap();
    transport.set_send_delay(Duration::from_millis(200));

    let sender = Arc::clone(&producer);
    let send = tokio::spawn(async move {
        sender
            .send(&OutboundMessage::text("in flight"), None)
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), producer.shutdown())
        .await
        .expect("shutdown must not wait for in-flight sends");

    assert_eq!(transport.disconnect_count(), 1);
    // The send may fail, but must not hang or panic
    let _ = tokio::time::timeout(Duration::from_secs(2), send)
        .await
        .expect("send should finish");
}

#[tokio::test]
async fn test_send_after_shutdown_reconnects() {
    let (producer, transport, broker) = producer_fixture(Duration::from_millis(10));
    producer.init().await.unwrap();
    producer.shutdown().await;

    producer
        .send(&OutboundMessage::text("back again"), None)
        .await
        .unwrap();

    assert_eq!(transport.connect_count(), 2);
    assert_eq!(broker.messages("test-topic").len(), 1);
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let (producer, _, _) = producer_fixture(Duration::from_millis(10));
    let mut states = producer.subscribe_state();

    producer.init().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    producer.shutdown().await;
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_near_retry_leaves_producer_disconnected() {
    // Shutdown may land as the retry delay ends; the retry must not reopen
    // the connection that shutdown just released.
    for trial in 0..50u64 {
        // Arrange
        let (producer, transport, _) = producer_fixture(Duration::from_millis(5));
        let producer = Arc::new(producer);
        producer.init().await.unwrap();
        transport.fail_next_sends(1);

        let sender = Arc::clone(&producer);
        let send = tokio::spawn(async move {
            sender.send(&OutboundMessage::text("racing"), None).await
        });

        // Act
        tokio::time::sleep(Duration::from_micros(3_000 + trial * 80)).await;
        producer.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(2), send)
            .await
            .expect("send should finish")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Assert: a retry that beat shutdown was closed by it; a later one never connected
        assert!(!producer.is_connected(), "connected after shutdown in trial {trial}");
        if let Err(e) = result {
            assert!(matches!(e, SendError::Delivery { .. }), "trial {trial}: {e:?}");
        }
    }
}
