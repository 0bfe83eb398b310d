//! Message types exchanged with the broker
//!
//! [`OutboundMessage`] is what the producer publishes, [`ReceivedRecord`] is
//! what a consumer adapter hands back, and [`ConsumedMessage`] is the decoded
//! form passed to application handlers.

use bytes::Bytes;
use serde::Serialize;
use std::borrow::Cow;
use std::sync::atomic::{AtomicI64, Ordering};

static LAST_TIMESTAMP_MS: AtomicI64 = AtomicI64::new(0);

/// Producer-side clock in epoch milliseconds that never runs backwards
/// within this process, even if the wall clock is adjusted.
pub fn producer_timestamp_ms() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let previous = LAST_TIMESTAMP_MS.fetch_max(now, Ordering::SeqCst);
    previous.max(now)
}

/// A message waiting to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Target topic; overridden by an explicit topic passed to `send`
    pub topic: Option<String>,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp_ms: i64,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            topic: None,
            key: None,
            payload: payload.into(),
            timestamp_ms: producer_timestamp_ms(),
        }
    }

    /// UTF-8 text payload
    pub fn text(value: &str) -> Self {
        Self::new(Bytes::copy_from_slice(value.as_bytes()))
    }

    /// JSON-encoded payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Broker acknowledgement for a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A record exactly as the consumer adapter received it
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub timestamp_ms: Option<i64>,
}

/// Decoded record payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Record carried no value, or a zero-length one
    Empty,
    Data(Bytes),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Data(bytes) => bytes,
        }
    }
}

/// A record ready for an application handler
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Payload,
    pub timestamp_ms: Option<i64>,
}

impl ConsumedMessage {
    /// Decode a raw record. Never fails: a missing value becomes `Payload::Empty`.
    pub fn decode(record: ReceivedRecord) -> Self {
        let payload = match record.payload {
            Some(bytes) if !bytes.is_empty() => Payload::Data(bytes),
            _ => Payload::Empty,
        };

        Self {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            payload,
            timestamp_ms: record.timestamp_ms,
        }
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.payload.as_bytes())
    }
}
