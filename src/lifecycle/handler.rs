//! Application-facing message handlers invoked by the consumer

use crate::error::HandlerError;
use crate::message::ConsumedMessage;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

/// Receives every record the consumer reads.
///
/// Errors are logged and counted by the consumer; they never stop consumption.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &ConsumedMessage) -> Result<(), HandlerError>;
}

/// Logs each received value
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &ConsumedMessage) -> Result<(), HandlerError> {
        info!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            empty = message.payload.is_empty(),
            "Received: {}",
            message.text()
        );
        Ok(())
    }
}

/// Forwards each message into an mpsc channel for processing elsewhere
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: mpsc::Sender<ConsumedMessage>,
}

impl ChannelHandler {
    pub fn new(sender: mpsc::Sender<ConsumedMessage>) -> Self {
        Self { sender }
    }

    /// Handler plus the receiving end of a channel with the given capacity
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ConsumedMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: &ConsumedMessage) -> Result<(), HandlerError> {
        self.sender
            .send(message.clone())
            .await
            .map_err(|_| HandlerError::new("message channel closed"))
    }
}
