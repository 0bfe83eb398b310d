//! rdkafka producer adapter

use crate::config::{ConfigError, KeeperConfig};
use crate::error::BrokerError;
use crate::message::{DeliveryReceipt, OutboundMessage};
use crate::transport::kafka::client::{configure_producer, ClientTimeouts};
use crate::transport::{ProducerSession, ProducerTransport};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;
use tracing::debug;

/// Opens [`FutureProducer`] connections
#[derive(Clone)]
pub struct KafkaProducerTransport {
    client: ClientConfig,
    timeouts: ClientTimeouts,
    queue_timeout: Duration,
}

impl KafkaProducerTransport {
    pub fn from_config(config: &KeeperConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: configure_producer(config)?,
            timeouts: ClientTimeouts::from_config(config),
            queue_timeout: Duration::from_millis(config.producer.message_timeout_ms),
        })
    }
}

#[async_trait]
impl ProducerTransport for KafkaProducerTransport {
    type Session = KafkaProducerSession;

    /// Create the producer and confirm a broker answers a metadata request.
    /// librdkafka connects lazily, so without the probe an unreachable
    /// cluster would only surface on the first send.
    async fn connect(&self) -> Result<Self::Session, BrokerError> {
        let producer: FutureProducer = self.client.create()?;

        let probe = producer.clone();
        let timeout = self.timeouts.connect;
        tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, timeout))
            .await??;

        debug!("Kafka producer metadata probe succeeded");
        Ok(KafkaProducerSession {
            producer,
            queue_timeout: self.queue_timeout,
            flush_timeout: self.timeouts.operation,
        })
    }
}

/// An open [`FutureProducer`]
pub struct KafkaProducerSession {
    producer: FutureProducer,
    queue_timeout: Duration,
    flush_timeout: Duration,
}

#[async_trait]
impl ProducerSession for KafkaProducerSession {
    async fn send(
        &self,
        topic: &str,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, BrokerError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic)
            .payload(message.payload.as_ref())
            .timestamp(message.timestamp_ms);
        if let Some(key) = &message.key {
            record = record.key(key.as_ref());
        }

        let (partition, offset) = self
            .producer
            .send(record, self.queue_timeout)
            .await
            .map_err(|(e, _)| BrokerError::Kafka(e))?;

        Ok(DeliveryReceipt {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout)).await??;
        Ok(())
    }
}
