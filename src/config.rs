//! Configuration system for kafka-keeper
//!
//! Configuration is loaded from a TOML file. Every section and field has a
//! default, so an empty file (or no file at all) yields a working setup that
//! talks to a broker on `localhost:9092`.

use crate::lifecycle::retry::{BackoffKind, RetryPolicy};
use crate::provisioner::TopicSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct KeeperConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub topic: TopicSection,
    #[serde(default)]
    pub consumer: ConsumerSection,
    #[serde(default)]
    pub producer: ProducerSection,
    #[serde(default)]
    pub admin: AdminSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Broker connection settings shared by every client role
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Bootstrap broker addresses as `host:port`
    #[serde(default = "default_broker_addresses")]
    pub addresses: Vec<String>,
    /// Client identifier prefix; each role appends its own suffix
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing the SASL username
    pub username_env: Option<String>,
    /// Environment variable containing the SASL password
    pub password_env: Option<String>,
    /// librdkafka `security.protocol` (plaintext, ssl, sasl_plaintext, sasl_ssl)
    pub security_protocol: Option<String>,
    /// librdkafka `sasl.mechanism` (PLAIN, SCRAM-SHA-256, ...)
    pub sasl_mechanism: Option<String>,
    /// Timeout for broker metadata requests made while connecting
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Raw librdkafka properties applied to every client
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            addresses: default_broker_addresses(),
            client_id: default_client_id(),
            username_env: None,
            password_env: None,
            security_protocol: None,
            sasl_mechanism: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            properties: BTreeMap::new(),
        }
    }
}

fn default_broker_addresses() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_client_id() -> String {
    "kafka-keeper".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Default topic used by the producer and subscribed by the consumer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicSection {
    #[serde(default = "default_topic_name")]
    pub default: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

impl Default for TopicSection {
    fn default() -> Self {
        Self {
            default: default_topic_name(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
        }
    }
}

fn default_topic_name() -> String {
    "test-topic".to_string()
}

fn default_partitions() -> u32 {
    1
}

fn default_replication_factor() -> u32 {
    1
}

/// Consumer group and recovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerSection {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Start from the earliest retained offset when the group has no commit
    #[serde(default = "default_true")]
    pub from_beginning: bool,
    /// Delay between restart attempts after a failure or crash
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Bound on connect attempts made by an explicit `init()` (None = forever)
    pub startup_max_attempts: Option<u32>,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            from_beginning: true,
            restart_delay_ms: default_restart_delay_ms(),
            startup_max_attempts: None,
        }
    }
}

fn default_group_id() -> String {
    "group1".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_restart_delay_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// Producer delivery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerSection {
    /// Delay before the single retry of a failed send
    #[serde(default = "default_producer_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// librdkafka `message.timeout.ms`
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

impl Default for ProducerSection {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_producer_retry_delay_ms(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

fn default_producer_retry_delay_ms() -> u64 {
    2_000
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

/// Admin client retry settings used by topic provisioning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminSection {
    #[serde(default = "default_admin_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_admin_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_admin_backoff")]
    pub retry_backoff: BackoffKind,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            retry_initial_delay_ms: default_admin_initial_delay_ms(),
            retry_max_attempts: default_admin_max_attempts(),
            retry_backoff: default_admin_backoff(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl AdminSection {
    /// Bounded retry policy for admin calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            Duration::from_millis(self.retry_initial_delay_ms),
            self.retry_max_attempts,
            self.retry_backoff,
        )
    }
}

fn default_admin_initial_delay_ms() -> u64 {
    300
}

fn default_admin_max_attempts() -> u32 {
    5
}

fn default_admin_backoff() -> BackoffKind {
    BackoffKind::Exponential
}

fn default_operation_timeout_ms() -> u64 {
    10_000
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSection {
    /// Deployment environment; `production` disables the startup test message
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_smoke_test_message")]
    pub smoke_test_message: String,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            smoke_test_message: default_smoke_test_message(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl RuntimeSection {
    /// Whether a test message is published once startup completes
    pub fn smoke_test_enabled(&self) -> bool {
        !self.environment.eq_ignore_ascii_case("production")
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_smoke_test_message() -> String {
    "Hello Kafka!".to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker address: {0}")]
    InvalidBrokerAddress(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Values supplied on the command line that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub brokers: Option<String>,
    pub topic: Option<String>,
    pub environment: Option<String>,
}

impl KeeperConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: KeeperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command line overrides, then re-validate
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(brokers) = &overrides.brokers {
            self.broker.addresses = brokers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(topic) = &overrides.topic {
            self.topic.default = topic.clone();
        }
        if let Some(environment) = &overrides.environment {
            self.runtime.environment = environment.clone();
        }
        self.validate()
    }

    /// Check cross-field constraints the broker would otherwise reject at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.addresses.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one broker address is required".to_string(),
            ));
        }
        for address in &self.broker.addresses {
            validate_broker_address(address)?;
        }

        if self.broker.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.client_id must not be empty".to_string(),
            ));
        }

        self.default_topic_spec()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.consumer.group_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "consumer.group_id must not be empty".to_string(),
            ));
        }

        if self.consumer.heartbeat_interval_ms >= self.consumer.session_timeout_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "consumer.heartbeat_interval_ms ({}) must be lower than consumer.session_timeout_ms ({})",
                self.consumer.heartbeat_interval_ms, self.consumer.session_timeout_ms
            )));
        }

        if self.consumer.restart_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "consumer.restart_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.consumer.startup_max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "consumer.startup_max_attempts must be greater than 0 or omitted".to_string(),
            ));
        }

        if self.producer.retry_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "producer.retry_delay_ms must be greater than 0".to_string(),
            ));
        }

        self.admin
            .retry_policy()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("admin retry policy: {e}")))?;

        Ok(())
    }

    /// Topic specification for the configured default topic
    pub fn default_topic_spec(&self) -> Result<TopicSpec, crate::error::ProvisionError> {
        TopicSpec::new(
            self.topic.default.clone(),
            self.topic.partitions,
            self.topic.replication_factor,
        )
    }

    /// Comma separated bootstrap list as expected by librdkafka
    pub fn bootstrap_servers(&self) -> String {
        self.broker.addresses.join(",")
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get SASL username from environment variable
    pub fn get_broker_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    /// Get SASL password from environment variable
    pub fn get_broker_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    /// Get SASL credentials, failing if a configured variable is unset
    pub fn get_broker_credentials(&self) -> Result<Option<(String, String)>, ConfigError> {
        match (&self.broker.username_env, &self.broker.password_env) {
            (None, None) => Ok(None),
            (Some(user_env), Some(pass_env)) => {
                let username = std::env::var(user_env)
                    .map_err(|_| ConfigError::EnvVarNotFound(user_env.clone()))?;
                let password = std::env::var(pass_env)
                    .map_err(|_| ConfigError::EnvVarNotFound(pass_env.clone()))?;
                Ok(Some((username, password)))
            }
            _ => Err(ConfigError::InvalidConfig(
                "broker.username_env and broker.password_env must be set together".to_string(),
            )),
        }
    }
}

/// Validate a `host:port` broker address
pub fn validate_broker_address(address: &str) -> Result<(), ConfigError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidBrokerAddress(address.to_string()))?;

    if host.is_empty() || host.contains("://") {
        return Err(ConfigError::InvalidBrokerAddress(address.to_string()));
    }

    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(ConfigError::InvalidBrokerAddress(address.to_string())),
    }
}
