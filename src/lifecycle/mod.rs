//! Connection lifecycle management
//!
//! One manager per client role. Each owns its connection and state, and
//! serializes transitions behind its own lock; the two roles share nothing.

pub mod consumer;
pub mod handler;
pub mod producer;
pub mod retry;
pub mod state;

pub use consumer::{ConsumerManager, ConsumerSettings};
pub use handler::{ChannelHandler, LoggingHandler, MessageHandler};
pub use producer::{ProducerManager, ProducerSettings};
pub use retry::{BackoffKind, RetryDecision, RetryPolicy};
pub use state::{ConnectionState, Role};

use std::sync::Arc;
use uuid::Uuid;

/// An open connection tagged with an id for log correlation
pub(crate) struct ActiveSession<S> {
    pub(crate) id: Uuid,
    pub(crate) session: Arc<S>,
}

impl<S> ActiveSession<S> {
    pub(crate) fn new(session: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: Arc::new(session),
        }
    }
}

impl<S> Clone for ActiveSession<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            session: Arc::clone(&self.session),
        }
    }
}
