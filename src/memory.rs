//! In-memory broker transport.
//!
//! A complete in-process implementation of the transport traits. It is the
//! reference transport for the container's tests and for the demo binary.
//!
//! ## Semantics
//!
//! - Queues deliver each message to exactly one consumer, topics copy each
//!   message to every consumer subscribed at publish time.
//! - A connection only delivers while started.
//! - Transacted sessions and client-ack sessions hold received messages as
//!   unsettled until commit / acknowledge. Rollback and session close put them
//!   back at the head of their queue, flagged as redelivered.
//! - Selectors support a single `header = 'value'` equality.
//!
//! ## Fault injection
//!
//! [`MemoryBroker::fail_next_connections`], [`MemoryBroker::fail_next_sessions`]
//! and [`MemoryBroker::fail_next_consumers`] make the next `n` calls fail.
//! [`MemoryBroker::break_connections`] severs every live connection, the way
//! a broker restart would. Every operation is counted in [`BrokerStats`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::destination::{Destination, DestinationKind};
use crate::error::TransportError;
use crate::transport::{
    AckMode, Connection, ConnectionFactory, ConnectionFactoryPtr, ConnectionPtr, Consumer,
    Message, MessagePtr, Session, SessionPtr, TransportResult,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    destination: Destination,
    body: Bytes,
    headers: HashMap<String, String>,
    redelivered: bool,
}

type Inbox = Arc<Mutex<VecDeque<StoredMessage>>>;

/// Where an unsettled message goes back to on rollback
enum Origin {
    Queue(String),
    Subscriber(Inbox),
}

#[derive(Default)]
struct FaultPlan {
    failing_connections: u32,
    failing_sessions: u32,
    failing_consumers: u32,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    topics: HashMap<String, Vec<(u64, Inbox)>>,
    faults: FaultPlan,
    /// Connections created before the current generation are severed
    generation: u64,
    next_id: u64,
}

#[derive(Default)]
struct Counters {
    connection_attempts: AtomicU64,
    connections_created: AtomicU64,
    sessions_created: AtomicU64,
    consumer_attempts: AtomicU64,
    consumers_created: AtomicU64,
    delivered: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    acknowledgements: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Snapshot of broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Calls to `create_connection`, including refused ones
    pub connection_attempts: u64,
    pub connections_created: u64,
    pub sessions_created: u64,
    /// Calls to `create_consumer`, including refused ones
    pub consumer_attempts: u64,
    pub consumers_created: u64,
    pub delivered: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub acknowledgements: u64,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    counters: Counters,
}

impl BrokerInner {
    fn generation(&self) -> u64 {
        lock(&self.state).generation
    }
}

/// In-process message broker.
///
/// Cheap to clone; clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("stats", &self.stats())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// This broker as a shareable connection factory.
    pub fn connection_factory(&self) -> ConnectionFactoryPtr {
        Arc::new(self.clone())
    }

    /// Publish a message and return its id.
    pub fn send(
        &self,
        destination: &Destination,
        body: impl Into<Bytes>,
        headers: HashMap<String, String>,
    ) -> String {
        let message = StoredMessage {
            id: format!("ID:{}", Uuid::new_v4()),
            destination: destination.clone(),
            body: body.into(),
            headers,
            redelivered: false,
        };
        let id = message.id.clone();

        {
            let mut state = lock(&self.inner.state);
            match destination.kind() {
                DestinationKind::Queue => {
                    state
                        .queues
                        .entry(destination.name().to_string())
                        .or_default()
                        .push_back(message);
                }
                DestinationKind::Topic => {
                    let subscribers = state.topics.get(destination.name());
                    match subscribers {
                        Some(subscribers) if !subscribers.is_empty() => {
                            for (_, inbox) in subscribers {
                                lock(inbox).push_back(message.clone());
                            }
                        }
                        _ => trace!("No subscribers for {}, dropping {}", destination, id),
                    }
                }
            }
        }

        trace!("Published {} to {}", id, destination);
        self.inner.notify.notify_waiters();
        id
    }

    pub fn send_text(&self, destination: &Destination, text: &str) -> String {
        self.send(destination, Bytes::copy_from_slice(text.as_bytes()), HashMap::new())
    }

    /// Messages waiting on a queue, not counting unsettled ones.
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        lock(&self.inner.state)
            .queues
            .get(queue_name)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn fail_next_connections(&self, count: u32) {
        lock(&self.inner.state).faults.failing_connections = count;
    }

    pub fn fail_next_sessions(&self, count: u32) {
        lock(&self.inner.state).faults.failing_sessions = count;
    }

    pub fn fail_next_consumers(&self, count: u32) {
        lock(&self.inner.state).faults.failing_consumers = count;
    }

    /// Sever every connection created so far.
    pub fn break_connections(&self) {
        let generation = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            state.generation
        };
        debug!("Memory broker severed all connections (generation {})", generation);
        self.inner.notify.notify_waiters();
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            connection_attempts: c.connection_attempts.load(Ordering::SeqCst),
            connections_created: c.connections_created.load(Ordering::SeqCst),
            sessions_created: c.sessions_created.load(Ordering::SeqCst),
            consumer_attempts: c.consumer_attempts.load(Ordering::SeqCst),
            consumers_created: c.consumers_created.load(Ordering::SeqCst),
            delivered: c.delivered.load(Ordering::SeqCst),
            commits: c.commits.load(Ordering::SeqCst),
            rollbacks: c.rollbacks.load(Ordering::SeqCst),
            acknowledgements: c.acknowledgements.load(Ordering::SeqCst),
        }
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for MemoryBroker {
    async fn create_connection(&self) -> TransportResult<ConnectionPtr> {
        bump(&self.inner.counters.connection_attempts);

        let (generation, id) = {
            let mut state = lock(&self.inner.state);
            if state.faults.failing_connections > 0 {
                state.faults.failing_connections -= 1;
                return Err(TransportError::Connection(
                    "memory broker refused the connection".to_string(),
                ));
            }
            state.next_id += 1;
            (state.generation, state.next_id)
        };

        bump(&self.inner.counters.connections_created);
        let connection = ConnectionState {
            id: format!("memory-connection-{}", id),
            broker: self.inner.clone(),
            generation,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            client_id: Mutex::new(None),
        };
        debug!("Opened {}", connection.id);
        Ok(Arc::new(MemoryConnection {
            state: Arc::new(connection),
        }))
    }
}

struct ConnectionState {
    id: String,
    broker: Arc<BrokerInner>,
    generation: u64,
    started: AtomicBool,
    closed: AtomicBool,
    client_id: Mutex<Option<String>>,
}

impl ConnectionState {
    fn ensure_usable(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.broker.generation() > self.generation {
            return Err(TransportError::Connection(format!(
                "{} lost its link to the memory broker",
                self.id
            )));
        }
        Ok(())
    }
}

struct MemoryConnection {
    state: Arc<ConnectionState>,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &str {
        &self.state.id
    }

    async fn set_client_id(&self, client_id: &str) -> TransportResult<()> {
        self.state.ensure_usable()?;
        let mut current = lock(&self.state.client_id);
        if current.is_some() {
            return Err(TransportError::IllegalState(
                "client id already assigned".to_string(),
            ));
        }
        if self.state.started.load(Ordering::SeqCst) {
            return Err(TransportError::IllegalState(
                "client id must be set before the connection is started".to_string(),
            ));
        }
        *current = Some(client_id.to_string());
        Ok(())
    }

    async fn start(&self) -> TransportResult<()> {
        self.state.ensure_usable()?;
        self.state.started.store(true, Ordering::SeqCst);
        self.state.broker.notify.notify_waiters();
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.state.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.state.started.store(false, Ordering::SeqCst);
            debug!("Closed {}", self.state.id);
            self.state.broker.notify.notify_waiters();
        }
        Ok(())
    }

    async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AckMode,
    ) -> TransportResult<SessionPtr> {
        self.state.ensure_usable()?;
        {
            let mut state = lock(&self.state.broker.state);
            if state.faults.failing_sessions > 0 {
                state.faults.failing_sessions -= 1;
                return Err(TransportError::Session(
                    "memory broker refused the session".to_string(),
                ));
            }
        }
        bump(&self.state.broker.counters.sessions_created);

        Ok(Arc::new(MemorySession {
            state: Arc::new(SessionState {
                broker: self.state.broker.clone(),
                connection: self.state.clone(),
                transacted,
                ack_mode,
                closed: AtomicBool::new(false),
                unsettled: Mutex::new(Vec::new()),
            }),
        }))
    }
}

struct SessionState {
    broker: Arc<BrokerInner>,
    connection: Arc<ConnectionState>,
    transacted: bool,
    ack_mode: AckMode,
    closed: AtomicBool,
    unsettled: Mutex<Vec<(StoredMessage, Origin)>>,
}

impl SessionState {
    fn ensure_usable(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.connection.ensure_usable()
    }

    fn holds_unsettled(&self) -> bool {
        self.transacted || self.ack_mode == AckMode::Client
    }

    /// Put unsettled messages back at the head of their source, oldest first.
    fn requeue_unsettled(&self) -> usize {
        let unsettled: Vec<_> = lock(&self.unsettled).drain(..).collect();
        let count = unsettled.len();
        if count == 0 {
            return 0;
        }

        {
            let mut state = lock(&self.broker.state);
            for (mut message, origin) in unsettled.into_iter().rev() {
                message.redelivered = true;
                match origin {
                    Origin::Queue(name) => {
                        state.queues.entry(name).or_default().push_front(message)
                    }
                    Origin::Subscriber(inbox) => lock(&inbox).push_front(message),
                }
            }
        }
        self.broker.notify.notify_waiters();
        count
    }
}

struct MemorySession {
    state: Arc<SessionState>,
}

#[async_trait::async_trait]
impl Session for MemorySession {
    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        _no_local: bool,
    ) -> TransportResult<Box<dyn Consumer>> {
        self.state.ensure_usable()?;
        bump(&self.state.broker.counters.consumer_attempts);

        let selector = Selector::parse_optional(selector)?;

        let subscription = {
            let mut state = lock(&self.state.broker.state);
            if state.faults.failing_consumers > 0 {
                state.faults.failing_consumers -= 1;
                return Err(TransportError::Consumer(format!(
                    "memory broker refused a consumer on {}",
                    destination
                )));
            }
            match destination.kind() {
                DestinationKind::Queue => None,
                DestinationKind::Topic => {
                    state.next_id += 1;
                    let id = state.next_id;
                    let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
                    state
                        .topics
                        .entry(destination.name().to_string())
                        .or_default()
                        .push((id, inbox.clone()));
                    Some((id, inbox))
                }
            }
        };

        bump(&self.state.broker.counters.consumers_created);
        Ok(Box::new(MemoryConsumer {
            session: self.state.clone(),
            destination: destination.clone(),
            selector,
            subscription,
            closed: false,
        }))
    }

    fn is_transacted(&self) -> bool {
        self.state.transacted
    }

    fn acknowledge_mode(&self) -> AckMode {
        self.state.ack_mode
    }

    async fn commit(&self) -> TransportResult<()> {
        if !self.state.transacted {
            return Err(TransportError::IllegalState(
                "commit called on a non-transacted session".to_string(),
            ));
        }
        self.state
            .ensure_usable()
            .map_err(|e| TransportError::Transaction(e.to_string()))?;
        lock(&self.state.unsettled).clear();
        bump(&self.state.broker.counters.commits);
        Ok(())
    }

    async fn rollback(&self) -> TransportResult<()> {
        if !self.state.transacted {
            return Err(TransportError::IllegalState(
                "rollback called on a non-transacted session".to_string(),
            ));
        }
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let requeued = self.state.requeue_unsettled();
        trace!("Rolled back {} message(s)", requeued);
        bump(&self.state.broker.counters.rollbacks);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.state.requeue_unsettled();
        }
        Ok(())
    }
}

/// `header = 'value'` equality selector
#[derive(Debug, Clone, PartialEq, Eq)]
struct Selector {
    header: String,
    value: String,
}

impl Selector {
    fn parse_optional(expression: Option<&str>) -> TransportResult<Option<Self>> {
        match expression.map(str::trim) {
            None | Some("") => Ok(None),
            Some(expression) => Self::parse(expression).map(Some),
        }
    }

    fn parse(expression: &str) -> TransportResult<Self> {
        let invalid = || TransportError::Consumer(format!("invalid selector: {}", expression));

        let (header, value) = expression.split_once('=').ok_or_else(invalid)?;
        let header = header.trim();
        let value = value.trim();
        if header.is_empty() || value.is_empty() {
            return Err(invalid());
        }
        let value = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .unwrap_or(value);

        Ok(Self {
            header: header.to_string(),
            value: value.to_string(),
        })
    }

    fn matches(&self, message: &StoredMessage) -> bool {
        message.headers.get(&self.header) == Some(&self.value)
    }
}

struct MemoryConsumer {
    session: Arc<SessionState>,
    destination: Destination,
    selector: Option<Selector>,
    subscription: Option<(u64, Inbox)>,
    closed: bool,
}

impl MemoryConsumer {
    fn accepts(&self, message: &StoredMessage) -> bool {
        self.selector
            .as_ref()
            .map(|selector| selector.matches(message))
            .unwrap_or(true)
    }

    fn take_next(&self) -> Option<(StoredMessage, Origin)> {
        match &self.subscription {
            Some((_, inbox)) => {
                let mut inbox_guard = lock(inbox);
                let index = inbox_guard.iter().position(|m| self.accepts(m))?;
                let message = inbox_guard.remove(index)?;
                Some((message, Origin::Subscriber(inbox.clone())))
            }
            None => {
                let mut state = lock(&self.session.broker.state);
                let queue = state.queues.get_mut(self.destination.name())?;
                let index = queue.iter().position(|m| self.accepts(m))?;
                let message = queue.remove(index)?;
                Some((message, Origin::Queue(self.destination.name().to_string())))
            }
        }
    }

    fn unsubscribe(&mut self) {
        if let Some((id, _)) = self.subscription.take() {
            let mut state = lock(&self.session.broker.state);
            if let Some(subscribers) = state.topics.get_mut(self.destination.name()) {
                subscribers.retain(|(subscriber_id, _)| *subscriber_id != id);
            }
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[async_trait::async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&mut self, timeout: Option<Duration>) -> TransportResult<Option<MessagePtr>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let broker = self.session.broker.clone();

        loop {
            // Register interest before looking, so a publish in between still wakes us
            let notified = broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.session
                .ensure_usable()
                .map_err(|e| TransportError::Receive(e.to_string()))?;

            if self.session.connection.started.load(Ordering::SeqCst) {
                if let Some((stored, origin)) = self.take_next() {
                    bump(&broker.counters.delivered);
                    if self.session.holds_unsettled() {
                        lock(&self.session.unsettled).push((stored.clone(), origin));
                    }
                    return Ok(Some(Arc::new(MemoryMessage {
                        stored,
                        session: self.session.clone(),
                    })));
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.closed = true;
        self.unsubscribe();
        Ok(())
    }
}

struct MemoryMessage {
    stored: StoredMessage,
    session: Arc<SessionState>,
}

impl fmt::Debug for MemoryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMessage")
            .field("id", &self.stored.id)
            .field("destination", &self.stored.destination)
            .field("redelivered", &self.stored.redelivered)
            .field("body_len", &self.stored.body.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Message for MemoryMessage {
    fn message_id(&self) -> &str {
        &self.stored.id
    }

    fn destination(&self) -> &Destination {
        &self.stored.destination
    }

    fn body(&self) -> &Bytes {
        &self.stored.body
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.stored.headers
    }

    fn redelivered(&self) -> bool {
        self.stored.redelivered
    }

    async fn acknowledge(&self) -> TransportResult<()> {
        if self.session.transacted || self.session.ack_mode != AckMode::Client {
            return Ok(());
        }
        self.session
            .ensure_usable()
            .map_err(|e| TransportError::Acknowledge(e.to_string()))?;
        lock(&self.session.unsettled).clear();
        bump(&self.session.broker.counters.acknowledgements);
        Ok(())
    }
}
