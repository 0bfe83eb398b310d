//! Broker client adapter layer
//!
//! Lifecycle managers talk to the broker only through these traits. The
//! production implementation wraps rdkafka (see [`kafka`]); tests use the
//! in-memory broker from [`crate::testing::mocks`].
//!
//! Every trait is split into a *transport* (a factory that knows how to open a
//! connection) and a *session* (one open connection). Managers own at most one
//! session per role and drop it when the connection is lost.

use crate::error::BrokerError;
use crate::message::{DeliveryReceipt, OutboundMessage, ReceivedRecord};
use crate::provisioner::TopicSpec;
use async_trait::async_trait;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

pub mod kafka;

/// Opens producer connections
#[async_trait]
pub trait ProducerTransport: Send + Sync + 'static {
    type Session: ProducerSession;

    /// Open a new connection to the broker
    async fn connect(&self) -> Result<Self::Session, BrokerError>;
}

/// One open producer connection
#[async_trait]
pub trait ProducerSession: Send + Sync + 'static {
    /// Publish a message and wait for the broker acknowledgement
    async fn send(
        &self,
        topic: &str,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, BrokerError>;

    /// Flush outstanding messages and close the connection
    async fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Opens consumer connections and reports client crashes
#[async_trait]
pub trait ConsumerTransport: Send + Sync + 'static {
    type Session: ConsumerSession;

    /// Register the crash callback. Connections opened afterwards report
    /// unrecoverable failures through `notifier`.
    fn on_crash(&self, notifier: CrashNotifier);

    /// Open a new connection joined to the configured consumer group
    async fn connect(&self) -> Result<Self::Session, BrokerError>;
}

/// One open consumer connection
#[async_trait]
pub trait ConsumerSession: Send + Sync + 'static {
    /// Subscribe to a topic, optionally replaying from the earliest offset
    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), BrokerError>;

    /// Wait for the next record. `None` means the stream has ended.
    async fn recv(&self) -> Option<Result<ReceivedRecord, BrokerError>>;

    /// Signal liveness to the group coordinator after processing a record
    async fn heartbeat(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Opens admin sessions
#[async_trait]
pub trait AdminTransport: Send + Sync + 'static {
    type Session: AdminSession;

    async fn open(&self) -> Result<Self::Session, BrokerError>;
}

/// One open admin session
#[async_trait]
pub trait AdminSession: Send + Sync {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;

    /// Create topics. A topic that already exists is reported as
    /// [`BrokerError::TopicAlreadyExists`].
    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Unrecoverable failure reported by a consumer client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashEvent {
    pub reason: String,
    /// When the client reported it; reports older than the live connection are stale
    pub reported_at: Instant,
}

impl CrashEvent {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            reported_at: Instant::now(),
        }
    }
}

/// Handle given to a consumer transport for reporting crashes.
///
/// Sending never blocks, so it is safe to call from librdkafka callback threads.
#[derive(Debug, Clone)]
pub struct CrashNotifier {
    tx: mpsc::UnboundedSender<CrashEvent>,
}

impl CrashNotifier {
    pub fn new(tx: mpsc::UnboundedSender<CrashEvent>) -> Self {
        Self { tx }
    }

    /// Report a crash; silently dropped if the owning manager is gone
    pub fn notify(&self, reason: impl Into<String>) {
        if self.tx.send(CrashEvent::new(reason)).is_err() {
            debug!("Crash reported after consumer manager was dropped");
        }
    }
}
