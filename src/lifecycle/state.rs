//! Connection state tracking for producer and consumer roles

use crate::observability::metrics::metrics;
use std::fmt;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Which client a lifecycle manager drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of one client role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection held
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Connection open and usable
    Connected,
    /// Consumer subscribed and its consumption loop is active
    Running,
    /// Broker client reported an unrecoverable failure; teardown pending
    Crashed,
}

impl ConnectionState {
    /// Whether the connection is open (Running implies Connected)
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Running)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ConnectionState::Running)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Running => "running",
            ConnectionState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Single-writer state holder that publishes every transition.
///
/// Owners mutate it only while holding their own lifecycle mutex, so the
/// watch channel never sees interleaved transitions for one role.
#[derive(Debug)]
pub struct StateTracker {
    role: Role,
    tx: watch::Sender<ConnectionState>,
}

impl StateTracker {
    pub fn new(role: Role) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { role, tx }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Observe future transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`, logging the transition. No-op if already there.
    pub fn transition(&self, next: ConnectionState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            log_state_transition(self.role, previous, next);
            metrics().record_state_transition();
        }
    }
}

/// Log connection state transition (pure logging function)
pub fn log_state_transition(role: Role, from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!(role = %role, "Broker connection established");
        }
        (_, ConnectionState::Running) => {
            info!(role = %role, "Consumption loop running");
        }
        (_, ConnectionState::Crashed) => {
            error!(role = %role, from = %from, "Broker client crashed");
        }
        (ConnectionState::Connected | ConnectionState::Running, ConnectionState::Disconnected) => {
            warn!(role = %role, from = %from, "Broker connection closed");
        }
        _ => {
            info!(role = %role, "Connection state: {} -> {}", from, to);
        }
    }
}
