//! Process bootstrap: wires the managers together and drives startup and shutdown
//!
//! Startup order is consumer, producer, default topic, then an optional smoke
//! test message. Shutdown stops both managers concurrently within a grace
//! period; shutdown problems are logged and never block process exit.

use crate::config::KeeperConfig;
use crate::error::{KeeperError, ShutdownError};
use crate::lifecycle::{
    ConsumerManager, ConsumerSettings, LoggingHandler, MessageHandler, ProducerManager,
    ProducerSettings,
};
use crate::message::OutboundMessage;
use crate::observability::metrics::metrics;
use crate::provisioner::{EnsureTopic, TopicProvisioner};
use crate::transport::kafka::{KafkaAdminTransport, KafkaConsumerTransport, KafkaProducerTransport};
use crate::transport::{AdminTransport, ConsumerTransport, ProducerTransport};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Application running on the rdkafka adapters
pub type KafkaApplication = Application<KafkaProducerTransport, KafkaConsumerTransport>;

/// Owns both lifecycle managers and the topic provisioner
pub struct Application<P: ProducerTransport, C: ConsumerTransport> {
    config: KeeperConfig,
    producer: Arc<ProducerManager<P>>,
    consumer: Arc<ConsumerManager<C>>,
    provisioner: Arc<dyn EnsureTopic>,
}

impl KafkaApplication {
    /// Build the application on rdkafka clients, logging every received value
    pub fn from_config(config: KeeperConfig) -> Result<Self, KeeperError> {
        let producer = KafkaProducerTransport::from_config(&config)?;
        let consumer = KafkaConsumerTransport::from_config(&config)?;
        let admin = KafkaAdminTransport::from_config(&config)?;
        Self::new(config, producer, consumer, admin, Arc::new(LoggingHandler))
    }
}

impl<P: ProducerTransport, C: ConsumerTransport> Application<P, C> {
    pub fn new<A: AdminTransport>(
        config: KeeperConfig,
        producer_transport: P,
        consumer_transport: C,
        admin_transport: A,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, KeeperError> {
        config.validate()?;

        let provisioner: Arc<dyn EnsureTopic> = Arc::new(TopicProvisioner::new(
            admin_transport,
            config.admin.retry_policy(),
        ));
        let producer =
            ProducerManager::new(producer_transport, ProducerSettings::from_config(&config));
        let consumer = ConsumerManager::new(
            consumer_transport,
            Arc::clone(&provisioner),
            handler,
            ConsumerSettings::from_config(&config)?,
        );

        Ok(Self {
            config,
            producer: Arc::new(producer),
            consumer: Arc::new(consumer),
            provisioner,
        })
    }

    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    pub fn producer(&self) -> &Arc<ProducerManager<P>> {
        &self.producer
    }

    pub fn consumer(&self) -> &Arc<ConsumerManager<C>> {
        &self.consumer
    }

    /// Bring the consumer and producer up, ensure the default topic and, outside
    /// production, publish the smoke test message.
    pub async fn start(&self) -> Result<(), KeeperError> {
        metrics().set_app_state("starting");

        self.consumer.init().await?;
        info!("Consumer running");

        self.producer.init().await?;
        info!("Producer connected");

        let spec = self.config.default_topic_spec()?;
        self.provisioner.ensure_topic(&spec).await?;

        if self.config.runtime.smoke_test_enabled() {
            let message = OutboundMessage::text(&self.config.runtime.smoke_test_message);
            let receipt = self.producer.send(&message, None).await?;
            info!(
                topic = %receipt.topic,
                partition = receipt.partition,
                offset = receipt.offset,
                "Smoke test message sent"
            );
        } else {
            info!(environment = %self.config.runtime.environment, "Smoke test message skipped");
        }

        metrics().set_app_state("running");
        Ok(())
    }

    /// Shut both managers down concurrently, giving up after `grace`
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ShutdownError> {
        metrics().set_app_state("stopping");
        info!(grace_ms = grace.as_millis() as u64, "Shutting down");

        let both = async {
            tokio::join!(self.consumer.shutdown(), self.producer.shutdown());
        };

        match tokio::time::timeout(grace, both).await {
            Ok(()) => {
                metrics().set_app_state("stopped");
                Ok(())
            }
            Err(_) => {
                let e = ShutdownError::GracePeriodElapsed(grace);
                warn!(error = %e, "Shutdown incomplete");
                metrics().set_app_state("error");
                Err(e)
            }
        }
    }

    /// Start, then run until `shutdown_signal` resolves.
    ///
    /// The signal is honoured during startup too, so an unreachable broker
    /// never prevents exit. A startup failure still shuts the managers down
    /// before being returned.
    pub async fn run_until<F>(&self, shutdown_signal: F) -> Result<(), KeeperError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown_signal);
        let grace = self.config.runtime.shutdown_grace();

        let started = tokio::select! {
            result = self.start() => Some(result),
            _ = &mut shutdown_signal => None,
        };

        match started {
            None => {
                info!("Shutdown requested during startup");
            }
            Some(Err(e)) => {
                error!(error = %e, "Startup failed");
                let _ = self.shutdown(grace).await;
                return Err(e);
            }
            Some(Ok(())) => {
                info!("Running until shutdown signal");
                shutdown_signal.await;
            }
        }

        // Grace period overruns are logged by shutdown() and never fail the run
        let _ = self.shutdown(grace).await;
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM, returning the signal name
pub async fn wait_for_shutdown_signal() -> Result<&'static str, std::io::Error> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ConnectionState;
    use crate::testing::mocks::{
        MockAdminTransport, MockBroker, MockConsumerTransport, MockProducerTransport,
    };

    fn quick_config(environment: &str) -> KeeperConfig {
        let mut config = KeeperConfig::default();
        config.runtime.environment = environment.to_string();
        config.consumer.restart_delay_ms = 10;
        config.producer.retry_delay_ms = 10;
        config.admin.retry_initial_delay_ms = 1;
        config
    }

    fn app(
        config: KeeperConfig,
    ) -> (
        Application<MockProducerTransport, MockConsumerTransport>,
        Arc<MockBroker>,
    ) {
        let broker = MockBroker::new();
        let app = Application::new(
            config,
            MockProducerTransport::new(Arc::clone(&broker)),
            MockConsumerTransport::new(Arc::clone(&broker)),
            MockAdminTransport::new(Arc::clone(&broker)),
            Arc::new(LoggingHandler),
        )
        .unwrap();
        (app, broker)
    }

    #[tokio::test]
    async fn test_start_sends_smoke_message_outside_production() {
        let (app, broker) = app(quick_config("development"));

        app.start().await.unwrap();

        assert!(app.consumer().is_running());
        assert!(app.producer().is_connected());
        let log = broker.messages("test-topic");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].payload.as_deref(), Some(&b"Hello Kafka!"[..]));

        app.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(app.consumer().state(), ConnectionState::Disconnected);
        assert_eq!(app.producer().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_start_skips_smoke_message_in_production() {
        let (app, broker) = app(quick_config("production"));

        app.start().await.unwrap();

        assert!(broker.topic("test-topic").is_some());
        assert!(broker.messages("test-topic").is_empty());
        app.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = quick_config("development");
        config.broker.addresses.clear();

        let broker = MockBroker::new();
        let result = Application::new(
            config,
            MockProducerTransport::new(Arc::clone(&broker)),
            MockConsumerTransport::new(Arc::clone(&broker)),
            MockAdminTransport::new(broker),
            Arc::new(LoggingHandler),
        );
        assert!(matches!(result, Err(KeeperError::Config(_))));
    }
}
