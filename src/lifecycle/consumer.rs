//! Consumer lifecycle management
//!
//! [`ConsumerManager`] owns at most one consumer connection and the task that
//! reads from it. Start-up failures and client crashes feed the same
//! fixed-delay restart loop, which keeps going until the consumer is running
//! again or shutdown is requested.
//!
//! Crash reports arrive from the broker client on an unbounded channel and are
//! applied by a single recovery task, so every state change happens under the
//! manager's own lock. A report only counts if it was raised after the current
//! session started consuming; anything older belongs to a connection that is
//! already gone.

use crate::config::{ConfigError, KeeperConfig};
use crate::error::{ConnectError, ShutdownError};
use crate::lifecycle_span;
use crate::lifecycle::handler::MessageHandler;
use crate::lifecycle::retry::{interruptible_sleep, RetryDecision, RetryPolicy};
use crate::lifecycle::state::{ConnectionState, Role, StateTracker};
use crate::lifecycle::ActiveSession;
use crate::message::ConsumedMessage;
use crate::observability::metrics::metrics;
use crate::provisioner::{EnsureTopic, TopicSpec};
use crate::transport::{ConsumerSession, ConsumerTransport, CrashEvent, CrashNotifier};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Pause after a receive error before polling again
const RECV_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Consumer behaviour knobs
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// Topic ensured and subscribed on every start
    pub topic: TopicSpec,
    pub from_beginning: bool,
    /// Fixed delay between restart attempts
    pub restart_delay: Duration,
    /// Bound on attempts made by an explicit `init()` (None = until running)
    pub startup_max_attempts: Option<u32>,
}

impl ConsumerSettings {
    pub fn from_config(config: &KeeperConfig) -> Result<Self, ConfigError> {
        let topic = config
            .default_topic_spec()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            topic,
            from_beginning: config.consumer.from_beginning,
            restart_delay: Duration::from_millis(config.consumer.restart_delay_ms),
            startup_max_attempts: config.consumer.startup_max_attempts,
        })
    }
}

struct ConsumerInner<S> {
    session: Option<ActiveSession<S>>,
    consume_task: Option<JoinHandle<()>>,
    running: bool,
    /// When the current session started consuming
    running_since: Option<Instant>,
}

impl<S> ConsumerInner<S> {
    /// Whether a crash report refers to the session that is consuming now
    fn is_live_report(&self, event: &CrashEvent) -> bool {
        match self.running_since {
            Some(since) if self.running => event.reported_at >= since,
            _ => false,
        }
    }
}

struct ConsumerShared<T: ConsumerTransport> {
    transport: T,
    provisioner: Arc<dyn EnsureTopic>,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
    inner: Mutex<ConsumerInner<T::Session>>,
    state: StateTracker,
    shutdown_tx: watch::Sender<bool>,
    crash_tx: mpsc::UnboundedSender<CrashEvent>,
}

/// Crash channel plumbing, consumed on the first `init()`
struct RecoveryWiring {
    crash_rx: Option<mpsc::UnboundedReceiver<CrashEvent>>,
    task: Option<JoinHandle<()>>,
}

/// Lifecycle manager for the inbound connection
pub struct ConsumerManager<T: ConsumerTransport> {
    shared: Arc<ConsumerShared<T>>,
    wiring: StdMutex<RecoveryWiring>,
}

impl<T: ConsumerTransport> ConsumerManager<T> {
    pub fn new(
        transport: T,
        provisioner: Arc<dyn EnsureTopic>,
        handler: Arc<dyn MessageHandler>,
        settings: ConsumerSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (crash_tx, crash_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(ConsumerShared {
                transport,
                provisioner,
                handler,
                settings,
                inner: Mutex::new(ConsumerInner {
                    session: None,
                    consume_task: None,
                    running: false,
                    running_since: None,
                }),
                state: StateTracker::new(Role::Consumer),
                shutdown_tx,
                crash_tx,
            }),
            wiring: StdMutex::new(RecoveryWiring {
                crash_rx: Some(crash_rx),
                task: None,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.current()
    }

    /// Observe connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.shared.settings
    }

    /// Connect, ensure the topic, subscribe and start consuming.
    ///
    /// Returns immediately if already running. Failed attempts are retried
    /// after the restart delay; with no `startup_max_attempts` this only
    /// returns once running or when [`shutdown`](Self::shutdown) is called.
    pub async fn init(&self) -> Result<(), ConnectError> {
        self.shared.shutdown_tx.send_replace(false);
        self.install_crash_recovery();
        self.shared
            .start_with_retry(self.shared.settings.startup_max_attempts)
            .await
    }

    /// Register the crash handler and spawn the recovery task, once per manager
    fn install_crash_recovery(&self) {
        let mut wiring = self.wiring.lock().unwrap_or_else(|p| p.into_inner());

        let Some(crash_rx) = wiring.crash_rx.take() else {
            return;
        };

        self.shared
            .transport
            .on_crash(CrashNotifier::new(self.shared.crash_tx.clone()));
        let shared = Arc::clone(&self.shared);
        wiring.task = Some(tokio::spawn(ConsumerShared::recovery_loop(shared, crash_rx)));
        debug!("Consumer crash handler registered");
    }

    /// Stop consuming and disconnect. Interrupts any pending restart delay.
    /// Failures are logged, never returned.
    pub async fn shutdown(&self) {
        self.shared.shutdown_tx.send_replace(true);

        let mut inner = self.shared.inner.lock().await;
        if inner.session.is_none() && !inner.running {
            debug!("Consumer shutdown requested while not connected");
            self.shared.state.transition(ConnectionState::Disconnected);
            return;
        }

        info!("Shutting down consumer");
        self.shared.teardown(&mut inner).await;
        metrics().connection_closed(Role::Consumer);
    }
}

impl<T: ConsumerTransport> Drop for ConsumerManager<T> {
    fn drop(&mut self) {
        if let Ok(mut wiring) = self.wiring.lock() {
            if let Some(task) = wiring.task.take() {
                task.abort();
            }
        }
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            if let Some(task) = inner.consume_task.take() {
                task.abort();
            }
        }
    }
}

impl<T: ConsumerTransport> ConsumerShared<T> {
    fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Run start attempts until one succeeds, the policy gives up, or shutdown
    async fn start_with_retry(&self, max_attempts: Option<u32>) -> Result<(), ConnectError> {
        let policy =
            RetryPolicy::fixed(self.settings.restart_delay).with_max_attempts(max_attempts);
        let mut attempts_made = 0u32;

        loop {
            let error = match self.start_once().await {
                Ok(()) => return Ok(()),
                Err(ConnectError::ShutdownRequested) => {
                    return Err(ConnectError::ShutdownRequested);
                }
                Err(e) => e,
            };
            attempts_made += 1;

            match policy.decide(attempts_made, self.shutdown_requested()) {
                RetryDecision::Proceed { attempt, delay } => {
                    error!(
                        attempt = attempts_made,
                        next_attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Consumer start failed, retrying"
                    );
                    if !interruptible_sleep(self.shutdown_tx.subscribe(), delay).await {
                        return Err(ConnectError::ShutdownRequested);
                    }
                }
                RetryDecision::AbortShutdownRequested => {
                    return Err(ConnectError::ShutdownRequested);
                }
                RetryDecision::AbortMaxAttemptsExceeded => {
                    error!(attempts = attempts_made, error = %error, "Consumer start attempts exhausted");
                    return Err(ConnectError::AttemptsExhausted {
                        attempts: attempts_made,
                        last: Box::new(error),
                    });
                }
            }
        }
    }

    /// One start attempt: connect, ensure topic, subscribe, spawn the loop
    async fn start_once(&self) -> Result<(), ConnectError> {
        let mut inner = self.inner.lock().await;
        // A shutdown that won the lock has already torn everything down
        if self.shutdown_requested() {
            debug!("Consumer start skipped, shutdown requested");
            return Err(ConnectError::ShutdownRequested);
        }
        if inner.running && inner.session.is_some() {
            debug!("Consumer already running");
            return Ok(());
        }

        let active = match inner.session.clone() {
            Some(active) => active,
            None => {
                self.state.transition(ConnectionState::Connecting);
                metrics().connection_attempt(Role::Consumer);

                match self.transport.connect().await {
                    Ok(session) => {
                        let active = ActiveSession::new(session);
                        info!(role = "consumer", connection_id = %active.id, "Consumer connected");
                        metrics().connection_established(Role::Consumer);
                        inner.session = Some(active.clone());
                        self.state.transition(ConnectionState::Connected);
                        active
                    }
                    Err(e) => {
                        metrics().connection_failed(Role::Consumer);
                        self.state.transition(ConnectionState::Disconnected);
                        return Err(ConnectError::Transport(e));
                    }
                }
            }
        };

        let topic = self.settings.topic.name();

        if let Err(e) = self.provisioner.ensure_topic(&self.settings.topic).await {
            self.teardown(&mut inner).await;
            return Err(ConnectError::Provision(e));
        }

        if let Err(source) = active
            .session
            .subscribe(topic, self.settings.from_beginning)
            .await
        {
            self.teardown(&mut inner).await;
            return Err(ConnectError::Subscribe {
                topic: topic.to_string(),
                source,
            });
        }

        inner.running_since = Some(Instant::now());
        let span = lifecycle_span!(Role::Consumer, active.id, topic = %topic);
        inner.consume_task = Some(tokio::spawn(
            consume_loop(
                Arc::clone(&active.session),
                Arc::clone(&self.handler),
                CrashNotifier::new(self.crash_tx.clone()),
                active.id,
            )
            .instrument(span),
        ));
        inner.running = true;
        self.state.transition(ConnectionState::Running);
        info!(
            topic,
            from_beginning = self.settings.from_beginning,
            connection_id = %active.id,
            "Consumer subscribed"
        );
        Ok(())
    }

    /// Stop the loop and drop the connection; caller holds the lock
    async fn teardown(&self, inner: &mut ConsumerInner<T::Session>) {
        if let Some(task) = inner.consume_task.take() {
            task.abort();
        }
        inner.running = false;
        inner.running_since = None;

        if let Some(active) = inner.session.take() {
            if let Err(e) = active
                .session
                .disconnect()
                .await
                .map_err(ShutdownError::Disconnect)
            {
                warn!(connection_id = %active.id, error = %e, "Consumer disconnect failed");
            }
        }

        self.state.transition(ConnectionState::Disconnected);
    }

    /// Apply crash reports: tear down, wait, restart. Runs for the manager's lifetime.
    async fn recovery_loop(shared: Arc<Self>, mut crash_rx: mpsc::UnboundedReceiver<CrashEvent>) {
        while let Some(event) = crash_rx.recv().await {
            if shared.shutdown_requested() {
                debug!(reason = %event.reason, "Ignoring crash reported after shutdown");
                continue;
            }

            {
                let mut inner = shared.inner.lock().await;
                if !inner.is_live_report(&event) {
                    debug!(reason = %event.reason, "Discarding crash report for a replaced connection");
                    continue;
                }

                error!(reason = %event.reason, "Consumer crashed, scheduling restart");
                metrics().consumer_crashed();
                shared.state.transition(ConnectionState::Crashed);
                metrics().connection_lost(Role::Consumer);
                shared.teardown(&mut inner).await;
            }

            if !interruptible_sleep(shared.shutdown_tx.subscribe(), shared.settings.restart_delay)
                .await
            {
                continue;
            }

            metrics().consumer_restarted();
            info!("Restarting consumer after crash");
            match shared.start_with_retry(None).await {
                Ok(()) => info!("Consumer recovered"),
                Err(ConnectError::ShutdownRequested) => {
                    debug!("Consumer recovery abandoned on shutdown");
                }
                Err(e) => error!(error = %e, "Consumer recovery stopped"),
            }
        }
    }
}

/// Read records until the stream ends, handing each to `handler`.
/// An ended stream is reported as a crash so the session gets replaced.
async fn consume_loop<S: ConsumerSession>(
    session: Arc<S>,
    handler: Arc<dyn MessageHandler>,
    crashes: CrashNotifier,
    connection_id: Uuid,
) {
    loop {
        let record = match session.recv().await {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                warn!(%connection_id, error = %e, "Receive failed");
                tokio::time::sleep(RECV_ERROR_PAUSE).await;
                continue;
            }
            None => {
                warn!(%connection_id, "Consumer stream ended");
                crashes.notify("consumer stream ended");
                break;
            }
        };

        metrics().message_received();
        let message = ConsumedMessage::decode(record);

        if let Err(e) = handler.handle(&message).await {
            metrics().handler_failed();
            error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Message handler failed"
            );
        }

        match session.heartbeat().await {
            Ok(()) => metrics().heartbeat(),
            Err(e) => debug!(%connection_id, error = %e, "Heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeeperConfig;
    use crate::lifecycle::LoggingHandler;
    use crate::provisioner::TopicProvisioner;
    use crate::testing::mocks::{MockAdminTransport, MockBroker, MockConsumerTransport};

    #[test]
    fn test_settings_from_default_config() {
        let settings = ConsumerSettings::from_config(&KeeperConfig::default()).unwrap();
        assert_eq!(settings.topic.name(), "test-topic");
        assert!(settings.from_beginning);
        assert_eq!(settings.restart_delay, Duration::from_secs(5));
        assert!(settings.startup_max_attempts.is_none());
    }

    #[test]
    fn test_settings_reject_invalid_topic() {
        let mut config = KeeperConfig::default();
        config.topic.default = String::new();
        assert!(ConsumerSettings::from_config(&config).is_err());
    }

    fn manager() -> (ConsumerManager<MockConsumerTransport>, MockConsumerTransport) {
        let broker = MockBroker::new();
        let transport = MockConsumerTransport::new(Arc::clone(&broker));
        let provisioner: Arc<dyn EnsureTopic> = Arc::new(TopicProvisioner::new(
            MockAdminTransport::new(broker),
            RetryPolicy::fixed(Duration::from_millis(1)),
        ));
        let settings = ConsumerSettings {
            topic: TopicSpec::with_partitions("test-topic", 1).unwrap(),
            from_beginning: true,
            restart_delay: Duration::from_millis(10),
            startup_max_attempts: None,
        };
        let manager = ConsumerManager::new(
            transport.clone(),
            provisioner,
            Arc::new(LoggingHandler),
            settings,
        );
        (manager, transport)
    }

    #[tokio::test]
    async fn test_start_refused_once_shutdown_requested() {
        // Arrange: the recovery task reaches the lock after shutdown released it
        let (manager, transport) = manager();
        manager.shared.shutdown_tx.send_replace(true);

        // Act
        let result = manager.shared.start_once().await;

        // Assert
        assert!(matches!(result, Err(ConnectError::ShutdownRequested)));
        assert_eq!(transport.connect_count(), 0);
        assert!(!manager.is_running());

        // An explicit init clears the request
        manager.init().await.unwrap();
        assert!(manager.is_running());
        manager.shutdown().await;
    }

    #[test]
    fn test_only_reports_newer_than_running_session_are_live() {
        let before = CrashEvent::new("old");
        let mut inner: ConsumerInner<()> = ConsumerInner {
            session: None,
            consume_task: None,
            running: false,
            running_since: None,
        };
        assert!(!inner.is_live_report(&before));

        inner.running = true;
        inner.running_since = Some(Instant::now());
        let after = CrashEvent::new("new");

        assert!(!inner.is_live_report(&before));
        assert!(inner.is_live_report(&after));
    }
}
