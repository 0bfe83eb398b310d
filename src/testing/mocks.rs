//! In-memory broker and mock client adapters for testing
//!
//! [`MockBroker`] keeps per-topic logs and the consumer group's committed
//! offsets, so producer, consumer and admin mocks sharing one broker behave
//! like a single-node cluster. Each mock transport is cheaply cloneable: keep
//! a clone in the test to inject failures and inspect call counts after
//! handing the original to a manager.

use crate::error::BrokerError;
use crate::message::{DeliveryReceipt, OutboundMessage, ReceivedRecord};
use crate::provisioner::TopicSpec;
use crate::transport::{
    AdminSession, AdminTransport, ConsumerSession, ConsumerTransport, CrashNotifier,
    ProducerSession, ProducerTransport,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Consume one pending injected failure, if any
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn maybe_delay(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

struct Subscriber {
    session_id: u64,
    topic: String,
    tx: mpsc::UnboundedSender<ReceivedRecord>,
}

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, TopicSpec>,
    logs: HashMap<String, Vec<ReceivedRecord>>,
    committed: HashMap<String, i64>,
    subscribers: Vec<Subscriber>,
}

/// Single-node in-memory broker with one consumer group
pub struct MockBroker {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    next_session_id: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            available: AtomicBool::new(true),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Simulate the broker going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::timeout("broker unreachable"))
        }
    }

    fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Create a topic directly, bypassing the admin API
    pub fn create_topic(&self, spec: TopicSpec) {
        lock(&self.state)
            .topics
            .insert(spec.name().to_string(), spec);
    }

    pub fn topic_names(&self) -> Vec<String> {
        lock(&self.state).topics.keys().cloned().collect()
    }

    pub fn topic(&self, name: &str) -> Option<TopicSpec> {
        lock(&self.state).topics.get(name).cloned()
    }

    /// Every record appended to `topic`, in offset order
    pub fn messages(&self, topic: &str) -> Vec<ReceivedRecord> {
        lock(&self.state)
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Offset the consumer group will resume from on `topic`
    pub fn committed_offset(&self, topic: &str) -> Option<i64> {
        lock(&self.state).committed.get(topic).copied()
    }

    /// Append a record as an external producer would
    pub fn publish(&self, topic: &str, payload: Option<Bytes>) -> ReceivedRecord {
        self.append(topic, None, payload, Some(crate::message::producer_timestamp_ms()))
    }

    fn append(
        &self,
        topic: &str,
        key: Option<Bytes>,
        payload: Option<Bytes>,
        timestamp_ms: Option<i64>,
    ) -> ReceivedRecord {
        let mut state = lock(&self.state);
        let log = state.logs.entry(topic.to_string()).or_default();
        let record = ReceivedRecord {
            topic: topic.to_string(),
            partition: 0,
            offset: log.len() as i64,
            key,
            payload,
            timestamp_ms,
        };
        log.push(record.clone());

        state
            .subscribers
            .retain(|sub| sub.topic != topic || sub.tx.send(record.clone()).is_ok());
        record
    }

    fn subscribe(
        &self,
        session_id: u64,
        topic: &str,
        from_beginning: bool,
        tx: mpsc::UnboundedSender<ReceivedRecord>,
    ) {
        let mut state = lock(&self.state);
        let log_len = state.logs.get(topic).map_or(0, Vec::len) as i64;
        let start = state
            .committed
            .get(topic)
            .copied()
            .unwrap_or(if from_beginning { 0 } else { log_len });

        if let Some(log) = state.logs.get(topic) {
            for record in log.iter().skip(start.max(0) as usize) {
                let _ = tx.send(record.clone());
            }
        }

        state.subscribers.push(Subscriber {
            session_id,
            topic: topic.to_string(),
            tx,
        });
    }

    fn commit(&self, topic: &str, next_offset: i64) {
        let mut state = lock(&self.state);
        let committed = state.committed.entry(topic.to_string()).or_insert(0);
        *committed = (*committed).max(next_offset);
    }

    fn drop_session(&self, session_id: u64) {
        lock(&self.state)
            .subscribers
            .retain(|sub| sub.session_id != session_id);
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct ProducerControl {
    broker: Arc<MockBroker>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    send_attempts: AtomicUsize,
    fail_connects: AtomicU32,
    fail_sends: AtomicU32,
    connect_delay_ms: AtomicU64,
    send_delay_ms: AtomicU64,
}

/// Mock producer transport backed by a [`MockBroker`]
#[derive(Clone)]
pub struct MockProducerTransport {
    control: Arc<ProducerControl>,
}

impl MockProducerTransport {
    pub fn new(broker: Arc<MockBroker>) -> Self {
        Self {
            control: Arc::new(ProducerControl {
                broker,
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                send_attempts: AtomicUsize::new(0),
                fail_connects: AtomicU32::new(0),
                fail_sends: AtomicU32::new(0),
                connect_delay_ms: AtomicU64::new(0),
                send_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn broker(&self) -> &Arc<MockBroker> {
        &self.control.broker
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.control.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.control.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.control
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.control
            .send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Physical connections opened
    pub fn connect_count(&self) -> usize {
        self.control.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.control.disconnects.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.control.send_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProducerTransport for MockProducerTransport {
    type Session = MockProducerSession;

    async fn connect(&self) -> Result<Self::Session, BrokerError> {
        self.control.connects.fetch_add(1, Ordering::SeqCst);
        maybe_delay(&self.control.connect_delay_ms).await;
        self.control.broker.check_available()?;
        if take_failure(&self.control.fail_connects) {
            return Err(BrokerError::rejected("injected connect failure"));
        }
        Ok(MockProducerSession {
            control: Arc::clone(&self.control),
            closed: AtomicBool::new(false),
        })
    }
}

/// One mock producer connection
pub struct MockProducerSession {
    control: Arc<ProducerControl>,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerSession for MockProducerSession {
    async fn send(
        &self,
        topic: &str,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, BrokerError> {
        self.control.send_attempts.fetch_add(1, Ordering::SeqCst);
        maybe_delay(&self.control.send_delay_ms).await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.control.broker.check_available()?;
        if take_failure(&self.control.fail_sends) {
            return Err(BrokerError::rejected("injected send failure"));
        }

        let record = self.control.broker.append(
            topic,
            message.key.clone(),
            Some(message.payload.clone()),
            Some(message.timestamp_ms),
        );
        Ok(DeliveryReceipt {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
        })
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.control.disconnects.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct ConsumerControl {
    broker: Arc<MockBroker>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    subscribes: AtomicUsize,
    heartbeats: AtomicUsize,
    crash_registrations: AtomicUsize,
    fail_connects: AtomicU32,
    fail_subscribes: AtomicU32,
    fail_disconnects: AtomicU32,
    notifier: Mutex<Option<CrashNotifier>>,
    live_sessions: Mutex<Vec<Arc<SessionLink>>>,
}

/// Sending half of a session's record stream
struct SessionLink {
    id: u64,
    tx: Mutex<Option<mpsc::UnboundedSender<ReceivedRecord>>>,
}

impl SessionLink {
    fn close(&self, broker: &MockBroker) {
        lock(&self.tx).take();
        broker.drop_session(self.id);
    }
}

/// Mock consumer transport backed by a [`MockBroker`]
#[derive(Clone)]
pub struct MockConsumerTransport {
    control: Arc<ConsumerControl>,
}

impl MockConsumerTransport {
    pub fn new(broker: Arc<MockBroker>) -> Self {
        Self {
            control: Arc::new(ConsumerControl {
                broker,
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
                heartbeats: AtomicUsize::new(0),
                crash_registrations: AtomicUsize::new(0),
                fail_connects: AtomicU32::new(0),
                fail_subscribes: AtomicU32::new(0),
                fail_disconnects: AtomicU32::new(0),
                notifier: Mutex::new(None),
                live_sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn broker(&self) -> &Arc<MockBroker> {
        &self.control.broker
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.control.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_subscribes(&self, n: u32) {
        self.control.fail_subscribes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_disconnects(&self, n: u32) {
        self.control.fail_disconnects.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.control.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.control.disconnects.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.control.subscribes.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.control.heartbeats.load(Ordering::SeqCst)
    }

    /// Times `on_crash` has been called
    pub fn crash_registrations(&self) -> usize {
        self.control.crash_registrations.load(Ordering::SeqCst)
    }

    /// Kill every open session and report the crash.
    /// Returns false if no crash handler was registered.
    pub fn crash(&self, reason: &str) -> bool {
        self.end_streams();
        self.report_crash(reason)
    }

    /// End the record stream of every open session without reporting anything
    pub fn end_streams(&self) {
        let sessions: Vec<_> = lock(&self.control.live_sessions).drain(..).collect();
        for link in sessions {
            link.close(&self.control.broker);
        }
    }

    /// Report a crash without touching open sessions, as a client from a
    /// failed connect attempt does when its brokers stay down
    pub fn report_crash(&self, reason: &str) -> bool {
        match lock(&self.control.notifier).as_ref() {
            Some(notifier) => {
                notifier.notify(reason);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ConsumerTransport for MockConsumerTransport {
    type Session = MockConsumerSession;

    fn on_crash(&self, notifier: CrashNotifier) {
        self.control
            .crash_registrations
            .fetch_add(1, Ordering::SeqCst);
        *lock(&self.control.notifier) = Some(notifier);
    }

    async fn connect(&self) -> Result<Self::Session, BrokerError> {
        self.control.connects.fetch_add(1, Ordering::SeqCst);
        self.control.broker.check_available()?;
        if take_failure(&self.control.fail_connects) {
            return Err(BrokerError::rejected("injected connect failure"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(SessionLink {
            id: self.control.broker.next_session_id(),
            tx: Mutex::new(Some(tx)),
        });
        lock(&self.control.live_sessions).push(Arc::clone(&link));

        Ok(MockConsumerSession {
            control: Arc::clone(&self.control),
            link,
            rx: AsyncMutex::new(rx),
        })
    }
}

/// One mock consumer connection
pub struct MockConsumerSession {
    control: Arc<ConsumerControl>,
    link: Arc<SessionLink>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<ReceivedRecord>>,
}

impl MockConsumerSession {
    fn is_open(&self) -> bool {
        lock(&self.link.tx).is_some()
    }
}

#[async_trait]
impl ConsumerSession for MockConsumerSession {
    async fn subscribe(&self, topic: &str, from_beginning: bool) -> Result<(), BrokerError> {
        self.control.subscribes.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.control.fail_subscribes) {
            return Err(BrokerError::rejected("injected subscribe failure"));
        }

        let tx = lock(&self.link.tx).clone().ok_or(BrokerError::Closed)?;
        self.control
            .broker
            .subscribe(self.link.id, topic, from_beginning, tx);
        Ok(())
    }

    async fn recv(&self) -> Option<Result<ReceivedRecord, BrokerError>> {
        let record = self.rx.lock().await.recv().await?;
        // Auto-commit on delivery, like enable.auto.commit
        self.control.broker.commit(&record.topic, record.offset + 1);
        Some(Ok(record))
    }

    async fn heartbeat(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }
        self.control.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.control.disconnects.fetch_add(1, Ordering::SeqCst);
        self.link.close(&self.control.broker);
        lock(&self.control.live_sessions).retain(|l| l.id != self.link.id);

        if take_failure(&self.control.fail_disconnects) {
            return Err(BrokerError::rejected("injected disconnect failure"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

struct AdminControl {
    broker: Arc<MockBroker>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_opens: AtomicU32,
    fail_lists: AtomicU32,
    fail_closes: AtomicU32,
    reject_creates: AtomicBool,
    stale_listing: AtomicBool,
    create_requests: Mutex<Vec<TopicSpec>>,
}

/// Mock admin transport backed by a [`MockBroker`]
#[derive(Clone)]
pub struct MockAdminTransport {
    control: Arc<AdminControl>,
}

impl MockAdminTransport {
    pub fn new(broker: Arc<MockBroker>) -> Self {
        Self {
            control: Arc::new(AdminControl {
                broker,
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_opens: AtomicU32::new(0),
                fail_lists: AtomicU32::new(0),
                fail_closes: AtomicU32::new(0),
                reject_creates: AtomicBool::new(false),
                stale_listing: AtomicBool::new(false),
                create_requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn broker(&self) -> &Arc<MockBroker> {
        &self.control.broker
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.control.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_lists(&self, n: u32) {
        self.control.fail_lists.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_closes(&self, n: u32) {
        self.control.fail_closes.store(n, Ordering::SeqCst);
    }

    /// Reject every create request (e.g. insufficient brokers for the replication factor)
    pub fn reject_creates(&self, reject: bool) {
        self.control.reject_creates.store(reject, Ordering::SeqCst);
    }

    /// Make listings omit every topic, as when another client creates one
    /// between our list and create calls
    pub fn set_stale_listing(&self, stale: bool) {
        self.control.stale_listing.store(stale, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.control.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.control.closes.load(Ordering::SeqCst)
    }

    /// Every topic spec passed to `create_topics`
    pub fn create_requests(&self) -> Vec<TopicSpec> {
        lock(&self.control.create_requests).clone()
    }
}

#[async_trait]
impl AdminTransport for MockAdminTransport {
    type Session = MockAdminSession;

    async fn open(&self) -> Result<Self::Session, BrokerError> {
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        self.control.broker.check_available()?;
        if take_failure(&self.control.fail_opens) {
            return Err(BrokerError::rejected("injected admin open failure"));
        }
        Ok(MockAdminSession {
            control: Arc::clone(&self.control),
        })
    }
}

/// One mock admin session
pub struct MockAdminSession {
    control: Arc<AdminControl>,
}

#[async_trait]
impl AdminSession for MockAdminSession {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        self.control.broker.check_available()?;
        if take_failure(&self.control.fail_lists) {
            return Err(BrokerError::rejected("injected list failure"));
        }
        if self.control.stale_listing.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self.control.broker.topic_names())
    }

    async fn create_topics(&self, specs: &[TopicSpec]) -> Result<(), BrokerError> {
        lock(&self.control.create_requests).extend(specs.iter().cloned());
        self.control.broker.check_available()?;

        if self.control.reject_creates.load(Ordering::SeqCst) {
            return Err(BrokerError::rejected("topic creation rejected"));
        }

        for spec in specs {
            if self.control.broker.topic(spec.name()).is_some() {
                return Err(BrokerError::TopicAlreadyExists(spec.name().to_string()));
            }
            self.control.broker.create_topic(spec.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.control.closes.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.control.fail_closes) {
            return Err(BrokerError::rejected("injected close failure"));
        }
        Ok(())
    }
}
