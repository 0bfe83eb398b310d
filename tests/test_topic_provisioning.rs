//! Topic provisioning tests
//!
//! Ensuring a topic is idempotent, tolerates creation races and always
//! releases the admin session.

use kafka_keeper::error::ProvisionError;
use kafka_keeper::lifecycle::RetryPolicy;
use kafka_keeper::observability::metrics::metrics;
use kafka_keeper::provisioner::{EnsureTopic, ProvisionOutcome, TopicProvisioner, TopicSpec};
use kafka_keeper::testing::mocks::{MockAdminTransport, MockBroker};
use std::time::Duration;

fn provisioner() -> (TopicProvisioner<MockAdminTransport>, MockAdminTransport) {
    let admin = MockAdminTransport::new(MockBroker::new());
    let policy = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(Some(3));
    (TopicProvisioner::new(admin.clone(), policy), admin)
}

#[tokio::test]
async fn test_missing_topic_is_created_once() {
    // Arrange
    let (provisioner, admin) = provisioner();
    let spec = TopicSpec::with_partitions("test-topic", 1).unwrap();

    // Act
    let first = provisioner.ensure_topic(&spec).await.unwrap();
    let second = provisioner.ensure_topic(&spec).await.unwrap();

    // Assert
    assert_eq!(first, ProvisionOutcome::Created);
    assert_eq!(second, ProvisionOutcome::AlreadyExisted);
    assert_eq!(admin.create_requests().len(), 1);
}

#[tokio::test]
async fn test_created_topic_has_requested_layout() {
    let (provisioner, admin) = provisioner();
    let spec = TopicSpec::with_partitions("orders", 3).unwrap();

    provisioner.ensure_topic(&spec).await.unwrap();

    let created = admin.broker().topic("orders").unwrap();
    assert_eq!(created.partitions(), 3);
    assert_eq!(created.replication_factor(), 1);
}

#[tokio::test]
async fn test_existing_topic_is_left_alone() {
    let (provisioner, admin) = provisioner();
    admin
        .broker()
        .create_topic(TopicSpec::new("orders", 6, 1).unwrap());

    let outcome = provisioner
        .ensure_topic(&TopicSpec::with_partitions("orders", 3).unwrap())
        .await
        .unwrap();

    assert_eq!(outcome, ProvisionOutcome::AlreadyExisted);
    assert!(admin.create_requests().is_empty());
    assert_eq!(admin.broker().topic("orders").unwrap().partitions(), 6);
}

#[tokio::test]
async fn test_lost_creation_race_counts_as_existing() {
    // Arrange: the listing misses a topic another client just created
    let (provisioner, admin) = provisioner();
    admin
        .broker()
        .create_topic(TopicSpec::with_partitions("orders", 1).unwrap());
    admin.set_stale_listing(true);

    // Act
    let outcome = provisioner
        .ensure_topic(&TopicSpec::with_partitions("orders", 1).unwrap())
        .await
        .unwrap();

    // Assert
    assert_eq!(outcome, ProvisionOutcome::AlreadyExisted);
    assert_eq!(admin.create_requests().len(), 1);
}

#[tokio::test]
async fn test_rejected_creation_is_reported() {
    let (provisioner, admin) = provisioner();
    admin.reject_creates(true);

    let err = provisioner
        .ensure_topic(&TopicSpec::new("orders", 1, 3).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::CreateRejected { ref topic, .. } if topic == "orders"));
    assert_eq!(admin.close_count(), 1);
}

#[tokio::test]
async fn test_transient_admin_failures_are_retried() {
    let (provisioner, admin) = provisioner();
    admin.fail_next_opens(2);
    admin.fail_next_lists(2);

    let outcome = provisioner
        .ensure_topic(&TopicSpec::with_partitions("orders", 1).unwrap())
        .await
        .unwrap();

    assert_eq!(outcome, ProvisionOutcome::Created);
    assert_eq!(admin.open_count(), 3);
}

#[tokio::test]
async fn test_unreachable_admin_gives_up_after_policy_attempts() {
    let (provisioner, admin) = provisioner();
    admin.broker().set_available(false);

    let err = provisioner
        .ensure_topic(&TopicSpec::with_partitions("orders", 1).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::SessionUnavailable(_)));
    assert_eq!(admin.open_count(), 3);
    assert_eq!(admin.close_count(), 0);
}

#[tokio::test]
async fn test_session_closed_even_when_close_fails() {
    let (provisioner, admin) = provisioner();
    admin.fail_next_closes(1);

    let outcome = provisioner
        .ensure_topic(&TopicSpec::with_partitions("orders", 1).unwrap())
        .await
        .unwrap();

    assert_eq!(outcome, ProvisionOutcome::Created);
    assert_eq!(admin.close_count(), 1);
}

#[tokio::test]
async fn test_session_closed_after_list_failure() {
    let (provisioner, admin) = provisioner();
    admin.fail_next_lists(10);

    let err = provisioner
        .ensure_topic(&TopicSpec::with_partitions("orders", 1).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::ListFailed(_)));
    assert_eq!(admin.close_count(), 1);
}

#[tokio::test]
async fn test_admin_sessions_are_counted_in_metrics() {
    // Arrange: counters are process-wide, so compare deltas
    let (provisioner, admin) = provisioner();
    admin.fail_next_opens(2);
    let before = metrics().get_metrics().admin.connection;

    // Act
    provisioner
        .ensure_topic(&TopicSpec::with_partitions("audited", 1).unwrap())
        .await
        .unwrap();

    // Assert
    let after = metrics().get_metrics().admin.connection;
    assert!(after.connection_attempts >= before.connection_attempts + 3);
    assert!(after.connection_failures >= before.connection_failures + 2);
    assert!(after.connections_established > before.connections_established);
}
