//! Error types for broker connection lifecycle management
//!
//! Each lifecycle concern gets its own error enum so callers can match on
//! exactly the failures an operation can produce. `KeeperError` aggregates
//! them for the bootstrap layer.

use rdkafka::error::KafkaError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a broker client adapter
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Kafka client error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Broker operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("Session is closed")]
    Closed,

    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("Broker rejected request: {0}")]
    Rejected(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BrokerError {
    /// Create a rejection error
    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Self::Rejected(message.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}

/// Errors from establishing a producer or consumer connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection failed: {0}")]
    Transport(#[source] BrokerError),

    #[error("Topic provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Subscription to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("Connection not established after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: Box<ConnectError>,
    },

    #[error("Shutdown requested before connection was established")]
    ShutdownRequested,
}

/// Errors from publishing a message
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Invalid target topic: {0}")]
    InvalidTopic(String),

    #[error("Producer is not connected: {0}")]
    NotConnected(#[source] ConnectError),

    #[error("Producer reconnect before retrying {topic} failed: {source}")]
    Reconnect {
        topic: String,
        #[source]
        source: ConnectError,
    },

    #[error("Delivery to {topic} failed after {attempts} attempt(s): {source}")]
    Delivery {
        topic: String,
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

impl SendError {
    /// Number of send attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            SendError::InvalidTopic(_) | SendError::NotConnected(_) => 0,
            SendError::Reconnect { .. } => 1,
            SendError::Delivery { attempts, .. } => *attempts,
        }
    }
}

/// Errors from ensuring a topic exists
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Invalid topic specification: {0}")]
    InvalidSpec(String),

    #[error("Admin session unavailable: {0}")]
    SessionUnavailable(#[source] BrokerError),

    #[error("Listing topics failed: {0}")]
    ListFailed(#[source] BrokerError),

    #[error("Creating topic {topic} was rejected: {source}")]
    CreateRejected {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

/// Errors observed while shutting down. These are logged, never fatal.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Disconnect failed: {0}")]
    Disconnect(#[source] BrokerError),

    #[error("Shutdown did not complete within {0:?}")]
    GracePeriodElapsed(Duration),
}

/// Failure reported by an application message handler
#[derive(Debug, Error)]
#[error("Message handler failed: {message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error for application bootstrap
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Provision error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
