//! Kafka adapters built on rdkafka (librdkafka)

pub mod admin;
pub mod client;
pub mod consumer;
pub mod producer;

pub use admin::{KafkaAdminSession, KafkaAdminTransport};
pub use client::{configure_client, CrashContext};
pub use consumer::{KafkaConsumerSession, KafkaConsumerTransport};
pub use producer::{KafkaProducerSession, KafkaProducerTransport};
