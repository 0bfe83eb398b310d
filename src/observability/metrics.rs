//! Thread-safe metrics collection system
//!
//! Provides atomic counters for connection lifecycle, delivery and
//! consumption statistics across the producer and consumer roles.

use crate::lifecycle::state::Role;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Connection counters for one client role
#[derive(Debug, Default)]
struct RoleCounters {
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
}

impl RoleCounters {
    fn snapshot(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            connected: self.connected.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            connections_lost: self.connections_lost.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.connections_established.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);
        self.connections_lost.store(0, Ordering::Relaxed);
    }
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    producer: RoleCounters,
    consumer: RoleCounters,
    admin: RoleCounters,

    // Delivery
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    send_retries: AtomicU64,

    // Consumption
    messages_received: AtomicU64,
    handler_failures: AtomicU64,
    last_heartbeat: AtomicU64,
    crashes: AtomicU64,
    restarts: AtomicU64,

    // Provisioning
    topics_created: AtomicU64,

    // Lifecycle
    app_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            producer: RoleCounters::default(),
            consumer: RoleCounters::default(),
            admin: RoleCounters::default(),
            messages_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            send_retries: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            topics_created: AtomicU64::new(0),
            app_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
        }
    }

    fn role(&self, role: Role) -> &RoleCounters {
        match role {
            Role::Producer => &self.producer,
            Role::Consumer => &self.consumer,
            Role::Admin => &self.admin,
        }
    }

    // Connection metrics
    pub fn connection_attempt(&self, role: Role) {
        self.role(role)
            .connection_attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self, role: Role) {
        let counters = self.role(role);
        counters
            .connections_established
            .fetch_add(1, Ordering::Relaxed);
        counters.connected.store(true, Ordering::Relaxed);
    }

    pub fn connection_failed(&self, role: Role) {
        let counters = self.role(role);
        counters.connection_failures.fetch_add(1, Ordering::Relaxed);
        counters.connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_lost(&self, role: Role) {
        let counters = self.role(role);
        counters.connections_lost.fetch_add(1, Ordering::Relaxed);
        counters.connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, role: Role) {
        self.role(role).connected.store(false, Ordering::Relaxed);
    }

    // Delivery metrics
    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_retried(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    // Consumption metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn consumer_crashed(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_restarted(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_topic_created(&self) {
        self.topics_created.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn record_state_transition(&self) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_app_state(&self, state: &str) {
        if let Ok(mut current_state) = self.app_state.lock() {
            if *current_state != state {
                *current_state = state.to_string();
            }
        }
    }

    fn current_app_state(&self) -> String {
        self.app_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.producer.reset();
        self.consumer.reset();
        self.admin.reset();
        for counter in [
            &self.messages_sent,
            &self.send_failures,
            &self.send_retries,
            &self.messages_received,
            &self.handler_failures,
            &self.last_heartbeat,
            &self.crashes,
            &self.restarts,
            &self.topics_created,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut state) = self.app_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        MetricsSnapshot {
            producer: ProducerMetrics {
                connection: self.producer.snapshot(),
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                send_failures: self.send_failures.load(Ordering::Relaxed),
                send_retries: self.send_retries.load(Ordering::Relaxed),
            },
            consumer: ConsumerMetrics {
                connection: self.consumer.snapshot(),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
                crashes: self.crashes.load(Ordering::Relaxed),
                restarts: self.restarts.load(Ordering::Relaxed),
            },
            admin: AdminMetrics {
                connection: self.admin.snapshot(),
                topics_created: self.topics_created.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_app_state(),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub producer: ProducerMetrics,
    pub consumer: ConsumerMetrics,
    pub admin: AdminMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
}

#[derive(Debug, Serialize)]
pub struct ProducerMetrics {
    pub connection: ConnectionMetrics,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub send_retries: u64,
}

#[derive(Debug, Serialize)]
pub struct ConsumerMetrics {
    pub connection: ConnectionMetrics,
    pub messages_received: u64,
    pub handler_failures: u64,
    pub last_heartbeat: u64,
    pub crashes: u64,
    pub restarts: u64,
}

#[derive(Debug, Serialize)]
pub struct AdminMetrics {
    pub connection: ConnectionMetrics,
    pub topics_created: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
