//! kafka-keeper - self-healing Kafka client lifecycle management
//!
//! Keeps one producer and one consumer connection alive for a long-running
//! service:
//! - a topic provisioner that creates the topic if it is missing
//! - a producer manager that connects on demand and retries a failed send
//!   once after reconnecting
//! - a consumer manager that restarts itself after crashes at a fixed delay
//!   until shutdown is requested
//! - bootstrap helpers that start everything and shut it down on SIGINT/SIGTERM
//!
//! # Quick Start
//!
//! ```rust
//! use kafka_keeper::lifecycle::{ProducerManager, ProducerSettings};
//! use kafka_keeper::message::OutboundMessage;
//! use kafka_keeper::testing::{MockBroker, MockProducerTransport};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! let producer = ProducerManager::new(
//!     MockProducerTransport::new(broker.clone()),
//!     ProducerSettings {
//!         default_topic: "test-topic".to_string(),
//!         retry_delay: Duration::from_millis(100),
//!     },
//! );
//!
//! let receipt = producer
//!     .send(&OutboundMessage::text("Hello Kafka!"), None)
//!     .await
//!     .unwrap();
//! assert_eq!(receipt.topic, "test-topic");
//! assert_eq!(broker.messages("test-topic").len(), 1);
//! # });
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod observability;
pub mod provisioner;
pub mod testing;
pub mod transport;

pub use bootstrap::{wait_for_shutdown_signal, Application, KafkaApplication};
pub use config::{ConfigError, ConfigOverrides, KeeperConfig};
pub use error::{
    BrokerError, ConnectError, HandlerError, KeeperError, ProvisionError, SendError,
    ShutdownError,
};
pub use lifecycle::{
    ConnectionState, ConsumerManager, MessageHandler, ProducerManager, RetryPolicy,
};
pub use message::{ConsumedMessage, DeliveryReceipt, OutboundMessage, Payload};
pub use provisioner::{EnsureTopic, TopicProvisioner, TopicSpec};
