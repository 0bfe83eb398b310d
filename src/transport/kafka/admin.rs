//! rdkafka admin adapter used for topic provisioning

use crate::config::{ConfigError, KeeperConfig};
use crate::error::BrokerError;
use crate::provisioner::TopicSpec;
use crate::transport::kafka::client::{configure_admin, ClientTimeouts};
use crate::transport::{AdminSession, AdminTransport};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::types::RDKafkaErrorCode;
use std::sync::Arc;

type KeeperAdminClient = AdminClient<DefaultClientContext>;

/// Opens [`AdminClient`] sessions
#[derive(Clone)]
pub struct KafkaAdminTransport {
    client: ClientConfig,
    timeouts: ClientTimeouts,
}

impl KafkaAdminTransport {
    pub fn from_config(config: &KeeperConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            client: configure_admin(config)?,
            timeouts: ClientTimeouts::from_config(config),
        })
    }
}

#[async_trait]
impl AdminTransport for KafkaAdminTransport {
    type Session = KafkaAdminSession;

    async fn open(&self) -> Result<Self::Session, BrokerError> {
        let admin: KeeperAdminClient = self.client.create()?;
        Ok(KafkaAdminSession {
            admin: Arc::new(admin),
            timeouts: self.timeouts,
        })
    }
}

/// An open [`AdminClient`]
pub struct KafkaAdminSession {
    admin: Arc<KeeperAdminClient>,
    timeouts: ClientTimeouts,
}

fn to_i32(value: u32, what: &str) -> Result<i32, BrokerError> {
    i32::try_from(value).map_err(|_| BrokerError::rejected(format!("{what} {value} out of range")))
}

#[async_trait]
impl AdminSession for KafkaAdminSession {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let admin = Arc::clone(&self.admin);
        let timeout = self.timeouts.connect;

        let metadata =
            tokio::task::spawn_blocking(move || admin.inner().fetch_metadata(None, timeout))
                .await??;

        Ok(metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .collect())
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<(), BrokerError> {
        let mut new_topics = Vec::with_capacity(specs.len());
        for spec in specs {
            new_topics.push(NewTopic::new(
                spec.name(),
                to_i32(spec.partitions(), "partition count")?,
                TopicReplication::Fixed(to_i32(spec.replication_factor(), "replication factor")?),
            ));
        }

        let options = AdminOptions::new().operation_timeout(Some(self.timeouts.operation));
        let results = self.admin.create_topics(&new_topics, &options).await?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(BrokerError::TopicAlreadyExists(topic));
                }
                Err((topic, code)) => {
                    return Err(BrokerError::rejected(format!("{topic}: {code}")));
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // AdminClient shuts down its background thread when dropped
        Ok(())
    }
}
