//! Producer lifecycle management
//!
//! [`ProducerManager`] owns at most one producer connection. It connects on
//! demand, and a failed send drops the connection, waits the retry delay,
//! reconnects and retries the same message exactly once.

use crate::config::KeeperConfig;
use crate::error::{ConnectError, SendError, ShutdownError};
use crate::lifecycle::retry::interruptible_sleep;
use crate::lifecycle::state::{ConnectionState, Role, StateTracker};
use crate::lifecycle::ActiveSession;
use crate::lifecycle_span;
use crate::message::{DeliveryReceipt, OutboundMessage};
use crate::observability::metrics::metrics;
use crate::provisioner::validate_topic_name;
use crate::transport::{ProducerSession, ProducerTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn, Instrument};

/// Producer behaviour knobs
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSettings {
    /// Topic used when neither the call nor the message names one
    pub default_topic: String,
    /// Wait before the single retry of a failed send
    pub retry_delay: Duration,
}

impl ProducerSettings {
    pub fn from_config(config: &KeeperConfig) -> Self {
        Self {
            default_topic: config.topic.default.clone(),
            retry_delay: Duration::from_millis(config.producer.retry_delay_ms),
        }
    }
}

/// Lifecycle manager for the outbound connection
pub struct ProducerManager<T: ProducerTransport> {
    transport: T,
    settings: ProducerSettings,
    session: Mutex<Option<ActiveSession<T::Session>>>,
    state: StateTracker,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: ProducerTransport> ProducerManager<T> {
    pub fn new(transport: T, settings: ProducerSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            settings,
            session: Mutex::new(None),
            state: StateTracker::new(Role::Producer),
            shutdown_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Observe connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    /// Open the connection if not already connected.
    ///
    /// Concurrent callers queue on the session lock and reuse the connection
    /// opened by the first one.
    pub async fn init(&self) -> Result<(), ConnectError> {
        self.acquire_session(true).await.map(|_| ())
    }

    async fn acquire_session(
        &self,
        reset_shutdown: bool,
    ) -> Result<ActiveSession<T::Session>, ConnectError> {
        let mut guard = self.session.lock().await;
        if let Some(active) = guard.as_ref() {
            return Ok(active.clone());
        }

        if reset_shutdown {
            self.shutdown_tx.send_replace(false);
        } else if *self.shutdown_tx.borrow() {
            // Shutdown already released the connection; a retry must not reopen it
            return Err(ConnectError::ShutdownRequested);
        }

        self.state.transition(ConnectionState::Connecting);
        metrics().connection_attempt(Role::Producer);

        match self.transport.connect().await {
            Ok(session) => {
                let active = ActiveSession::new(session);
                info!(role = "producer", connection_id = %active.id, "Producer connected");
                metrics().connection_established(Role::Producer);
                *guard = Some(active.clone());
                self.state.transition(ConnectionState::Connected);
                Ok(active)
            }
            Err(e) => {
                error!(role = "producer", error = %e, "Producer connection failed");
                metrics().connection_failed(Role::Producer);
                self.state.transition(ConnectionState::Disconnected);
                Err(ConnectError::Transport(e))
            }
        }
    }

    /// Forget `active` if it is still the current connection, then close it
    async fn discard_session(&self, active: &ActiveSession<T::Session>) {
        let owned = {
            let mut guard = self.session.lock().await;
            let is_current = guard
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(&current.session, &active.session));
            if is_current {
                guard.take();
                self.state.transition(ConnectionState::Disconnected);
                metrics().connection_lost(Role::Producer);
            }
            is_current
        };

        if owned {
            if let Err(e) = active.session.disconnect().await {
                debug!(connection_id = %active.id, error = %e, "Disconnect of failed producer connection errored");
            }
        }
    }

    fn resolve_topic(
        &self,
        message: &OutboundMessage,
        topic_override: Option<&str>,
    ) -> Result<String, SendError> {
        let topic = topic_override
            .or(message.topic.as_deref())
            .unwrap_or(&self.settings.default_topic);
        validate_topic_name(topic).map_err(|e| SendError::InvalidTopic(e.to_string()))?;
        Ok(topic.to_string())
    }

    /// Publish `message`, retrying once after reconnecting if the first attempt fails.
    ///
    /// The target topic is `topic_override`, else `message.topic`, else the
    /// configured default.
    pub async fn send(
        &self,
        message: &OutboundMessage,
        topic_override: Option<&str>,
    ) -> Result<DeliveryReceipt, SendError> {
        let topic = self.resolve_topic(message, topic_override)?;

        let active = self
            .acquire_session(true)
            .await
            .map_err(SendError::NotConnected)?;

        let first_error = match active
            .session
            .send(&topic, message)
            .instrument(lifecycle_span!(Role::Producer, active.id, topic = %topic))
            .await
        {
            Ok(receipt) => {
                metrics().message_sent();
                debug!(topic = %topic, partition = receipt.partition, offset = receipt.offset, "Message delivered");
                return Ok(receipt);
            }
            Err(e) => e,
        };

        warn!(
            topic = %topic,
            connection_id = %active.id,
            error = %first_error,
            retry_delay_ms = self.settings.retry_delay.as_millis() as u64,
            "Send failed, reconnecting before retry"
        );
        metrics().send_retried();
        self.discard_session(&active).await;

        if !interruptible_sleep(self.shutdown_tx.subscribe(), self.settings.retry_delay).await {
            metrics().send_failed();
            return Err(SendError::Delivery {
                topic,
                attempts: 1,
                source: first_error,
            });
        }

        let retry = match self.acquire_session(false).await {
            Ok(active) => active,
            Err(ConnectError::ShutdownRequested) => {
                debug!(topic = %topic, "Send retry abandoned on shutdown");
                metrics().send_failed();
                return Err(SendError::Delivery {
                    topic,
                    attempts: 1,
                    source: first_error,
                });
            }
            Err(source) => {
                metrics().send_failed();
                return Err(SendError::Reconnect { topic, source });
            }
        };

        match retry
            .session
            .send(&topic, message)
            .instrument(lifecycle_span!(Role::Producer, retry.id, topic = %topic))
            .await
        {
            Ok(receipt) => {
                metrics().message_sent();
                info!(topic = %topic, connection_id = %retry.id, "Message delivered on retry");
                Ok(receipt)
            }
            Err(source) => {
                error!(topic = %topic, error = %source, "Send retry failed");
                metrics().send_failed();
                self.discard_session(&retry).await;
                Err(SendError::Delivery {
                    topic,
                    attempts: 2,
                    source,
                })
            }
        }
    }

    /// Close the connection. Failures are logged, never returned, and an
    /// in-flight send never makes shutdown fail.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let taken = {
            let mut guard = self.session.lock().await;
            let taken = guard.take();
            if taken.is_some() {
                self.state.transition(ConnectionState::Disconnected);
            }
            taken
        };

        let Some(active) = taken else {
            debug!("Producer shutdown requested while not connected");
            return;
        };

        info!(connection_id = %active.id, "Disconnecting producer");
        if let Err(e) = active
            .session
            .disconnect()
            .await
            .map_err(ShutdownError::Disconnect)
        {
            warn!(role = "producer", error = %e, "Producer shutdown incomplete");
        }
        metrics().connection_closed(Role::Producer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockBroker, MockProducerTransport};

    fn settings() -> ProducerSettings {
        ProducerSettings {
            default_topic: "test-topic".to_string(),
            retry_delay: Duration::from_millis(10),
        }
    }

    fn manager() -> (ProducerManager<MockProducerTransport>, MockProducerTransport) {
        let transport = MockProducerTransport::new(MockBroker::new());
        (ProducerManager::new(transport.clone(), settings()), transport)
    }

    #[test]
    fn test_topic_resolution_order() {
        let (producer, _) = manager();
        let plain = OutboundMessage::text("x");
        let addressed = OutboundMessage::text("x").with_topic("from-message");

        assert_eq!(producer.resolve_topic(&plain, None).unwrap(), "test-topic");
        assert_eq!(
            producer.resolve_topic(&addressed, None).unwrap(),
            "from-message"
        );
        assert_eq!(
            producer
                .resolve_topic(&addressed, Some("from-call"))
                .unwrap(),
            "from-call"
        );
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let (producer, _) = manager();
        let result = producer.resolve_topic(&OutboundMessage::text("x"), Some(""));
        assert!(matches!(result, Err(SendError::InvalidTopic(_))));
    }

    #[tokio::test]
    async fn test_state_follows_connect_and_shutdown() {
        let (producer, _) = manager();
        assert_eq!(producer.state(), ConnectionState::Disconnected);

        producer.init().await.unwrap();
        assert_eq!(producer.state(), ConnectionState::Connected);

        producer.shutdown().await;
        assert_eq!(producer.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_disconnected() {
        let (producer, transport) = manager();
        transport.fail_next_connects(1);

        assert!(producer.init().await.is_err());
        assert_eq!(producer.state(), ConnectionState::Disconnected);
        assert!(!producer.is_connected());
    }

    #[tokio::test]
    async fn test_retry_connect_refused_after_shutdown() {
        // Arrange: shutdown lands between the retry delay and the reconnect
        let (producer, transport) = manager();
        producer.shutdown().await;

        // Act
        let retry = producer.acquire_session(false).await;

        // Assert
        assert!(matches!(retry, Err(ConnectError::ShutdownRequested)));
        assert_eq!(transport.connect_count(), 0);
        assert_eq!(producer.state(), ConnectionState::Disconnected);

        // A fresh init is an explicit restart
        producer.init().await.unwrap();
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_when_never_connected_is_noop() {
        let (producer, transport) = manager();
        producer.shutdown().await;
        assert_eq!(transport.disconnect_count(), 0);
    }
}
