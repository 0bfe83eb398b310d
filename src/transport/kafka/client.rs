//! librdkafka client configuration and shared helpers
//!
//! Pure functions that turn a [`KeeperConfig`] into an rdkafka
//! [`ClientConfig`] for a given role, plus the crash-reporting client context
//! used by consumers.

use crate::config::{ConfigError, KeeperConfig};
use crate::lifecycle::Role;
use crate::message::ReceivedRecord;
use crate::transport::CrashNotifier;
use bytes::Bytes;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::ConsumerContext;
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::types::RDKafkaErrorCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Build the client configuration shared by every role.
///
/// Each role gets its own `client.id` suffix so broker-side logs can tell the
/// connections apart. Raw `broker.properties` are applied last and win over
/// anything set here; keys starting with `#` are treated as commented out.
pub fn configure_client(config: &KeeperConfig, role: Role) -> Result<ClientConfig, ConfigError> {
    let broker = &config.broker;
    let mut client = ClientConfig::new();

    client.set("bootstrap.servers", config.bootstrap_servers());
    client.set("client.id", format!("{}-{}", broker.client_id, role.as_str()));

    if let Some(protocol) = &broker.security_protocol {
        client.set("security.protocol", protocol);
    }

    if let Some((username, password)) = config.get_broker_credentials()? {
        client.set("sasl.username", username);
        client.set("sasl.password", password);
        client.set(
            "sasl.mechanism",
            broker.sasl_mechanism.as_deref().unwrap_or("PLAIN"),
        );
    }

    for (key, value) in &broker.properties {
        if !key.trim_start().starts_with('#') {
            client.set(key, value);
        }
    }

    client.set_log_level(RDKafkaLogLevel::Info);
    Ok(client)
}

/// Producer configuration: shared settings plus delivery timeout
pub fn configure_producer(config: &KeeperConfig) -> Result<ClientConfig, ConfigError> {
    let mut client = configure_client(config, Role::Producer)?;
    client.set(
        "message.timeout.ms",
        config.producer.message_timeout_ms.to_string(),
    );
    Ok(client)
}

/// Consumer configuration: group membership, liveness and offset handling
pub fn configure_consumer(config: &KeeperConfig) -> Result<ClientConfig, ConfigError> {
    let consumer = &config.consumer;
    let mut client = configure_client(config, Role::Consumer)?;
    client
        .set("group.id", &consumer.group_id)
        .set("session.timeout.ms", consumer.session_timeout_ms.to_string())
        .set(
            "heartbeat.interval.ms",
            consumer.heartbeat_interval_ms.to_string(),
        )
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", offset_reset(consumer.from_beginning));
    Ok(client)
}

/// Admin configuration
pub fn configure_admin(config: &KeeperConfig) -> Result<ClientConfig, ConfigError> {
    configure_client(config, Role::Admin)
}

/// `auto.offset.reset` value for the given start position
pub fn offset_reset(from_beginning: bool) -> &'static str {
    if from_beginning {
        "earliest"
    } else {
        "latest"
    }
}

/// Broker-facing timeouts taken from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// Bound on the metadata probe made while connecting
    pub connect: Duration,
    /// Bound on flush during disconnect and on admin operations
    pub operation: Duration,
}

impl ClientTimeouts {
    pub fn from_config(config: &KeeperConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.broker.connect_timeout_ms),
            operation: Duration::from_millis(config.admin.operation_timeout_ms),
        }
    }
}

/// Copy an rdkafka message into an owned record
pub fn to_record<M: Message>(message: &M) -> ReceivedRecord {
    ReceivedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message.payload().map(Bytes::copy_from_slice),
        timestamp_ms: message.timestamp().to_millis(),
    }
}

/// Whether a client-level error means the consumer can no longer make progress
pub fn is_crash(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::Fatal) | Some(RDKafkaErrorCode::AllBrokersDown)
    )
}

/// Client context that reports fatal client errors as consumer crashes
#[derive(Clone, Default)]
pub struct CrashContext {
    notifier: Arc<Mutex<Option<CrashNotifier>>>,
}

impl CrashContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the notifier; applies to consumers already created from this context
    pub fn set_notifier(&self, notifier: CrashNotifier) {
        *self.notifier.lock().unwrap_or_else(|p| p.into_inner()) = Some(notifier);
    }

    fn report(&self, reason: String) {
        let guard = self.notifier.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(notifier) => notifier.notify(reason),
            None => warn!(%reason, "Consumer crashed with no crash handler registered"),
        }
    }
}

impl ClientContext for CrashContext {
    fn error(&self, error: KafkaError, reason: &str) {
        if is_crash(&error) {
            error!(error = %error, %reason, "Kafka consumer client failed");
            self.report(format!("{error}: {reason}"));
        } else {
            warn!(error = %error, %reason, "Kafka client error");
        }
    }
}

impl ConsumerContext for CrashContext {
    fn commit_callback(
        &self,
        result: KafkaResult<()>,
        _offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(()) => debug!("Offsets committed"),
            Err(e) => warn!(error = %e, "Offset commit failed"),
        }
    }
}
