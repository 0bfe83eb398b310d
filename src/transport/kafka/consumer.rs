//! rdkafka consumer adapter
//!
//! librdkafka runs group heartbeats and offset commits on its own threads, so
//! [`ConsumerSession::heartbeat`] is a no-op here. Fatal client errors are
//! routed through [`CrashContext`] to the registered [`CrashNotifier`].

use crate::config::{ConfigError, KeeperConfig};
use crate::error::BrokerError;
use crate::message::ReceivedRecord;
use crate::transport::kafka::client::{
    configure_consumer, offset_reset, to_record, ClientTimeouts, CrashContext,
};
use crate::transport::{ConsumerSession, ConsumerTransport, CrashNotifier};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

type KeeperStreamConsumer = StreamConsumer<CrashContext>;

/// Opens [`StreamConsumer`] connections joined to the configured group
#[derive(Clone)]
pub struct KafkaConsumerTransport {
    client: ClientConfig,
    context: CrashContext,
    timeouts: ClientTimeouts,
}

impl KafkaConsumerTransport {
    pub fn from_config(config: &KeeperConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: configure_consumer(config)?,
            context: CrashContext::new(),
            timeouts: ClientTimeouts::from_config(config),
        })
    }
}

fn create_consumer(
    client: &ClientConfig,
    context: &CrashContext,
) -> Result<Arc<KeeperStreamConsumer>, BrokerError> {
    let consumer: KeeperStreamConsumer = client.create_with_context(context.clone())?;
    Ok(Arc::new(consumer))
}

#[async_trait]
impl ConsumerTransport for KafkaConsumerTransport {
    type Session = KafkaConsumerSession;

    fn on_crash(&self, notifier: CrashNotifier) {
        self.context.set_notifier(notifier);
    }

    async fn connect(&self) -> Result<Self::Session, BrokerError> {
        let consumer = create_consumer(&self.client, &self.context)?;

        let probe = Arc::clone(&consumer);
        let timeout = self.timeouts.connect;
        tokio::task::spawn_blocking(move || probe.fetch_metadata(None, timeout)).await??;

        debug!("Kafka consumer metadata probe succeeded");
        Ok(KafkaConsumerSession {
            client: self.client.clone(),
            context: self.context.clone(),
            consumer: RwLock::new(consumer),
        })
    }
}

/// An open [`StreamConsumer`]
pub struct KafkaConsumerSession {
    client: ClientConfig,
    context: CrashContext,
    consumer: RwLock<Arc<KeeperStreamConsumer>>,
}

impl KafkaConsumerSession {
    fn current(&self) -> Arc<KeeperStreamConsumer> {
        Arc::clone(&self.consumer.read().unwrap_or_else(|p| p.into_inner()))
    }
}

#[async_trait]
impl ConsumerSession for KafkaConsumerSession {
    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), BrokerError> {
        let wanted = offset_reset(from_beginning);

        // auto.offset.reset is fixed at creation, so a different start
        // position needs a fresh client before anything is assigned
        if self.client.get("auto.offset.reset") != Some(wanted) {
            let mut client = self.client.clone();
            client.set("auto.offset.reset", wanted);
            let replacement = create_consumer(&client, &self.context)?;
            *self.consumer.write().unwrap_or_else(|p| p.into_inner()) = replacement;
            info!(topic, auto_offset_reset = wanted, "Recreated consumer for start position");
        }

        self.current().subscribe(&[topic])?;
        Ok(())
    }

    async fn recv(&self) -> Option<Result<ReceivedRecord, BrokerError>> {
        let consumer = self.current();
        let result = match consumer.recv().await {
            Ok(message) => Ok(to_record(&message)),
            Err(e) => Err(BrokerError::Kafka(e)),
        };
        Some(result)
    }

    async fn heartbeat(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.current().unsubscribe();
        Ok(())
    }
}
