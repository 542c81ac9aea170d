//! In-process fanout broker.
//!
//! `MemoryBroker` keeps exchanges, their bindings and queues in memory and
//! delivers every message published to an exchange to all queues bound to
//! it. It speaks the same [`Connector`]/[`Connection`]/[`SubChannel`] traits
//! as the AMQP adapter, so a whole cluster of nodes can run inside one
//! process.
//!
//! The broker also records what its clients do (sub-channels opened, how
//! many are open at once, which sub-channel published what, which queues
//! have consumers) and can be told to misbehave: refuse connections, reject
//! exchange declarations, fail publishes, or sever every open connection.
//!
//! Concurrency notes:
//! - All state sits behind short-lived `std::sync::Mutex` locks that are
//!   never held across an `.await`.
//! - Deliveries travel over one unbounded mpsc channel per queue; the
//!   consumer side is handed out once, so a queue has at most one consumer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Connection, Connector, DeliveryStream, ErrorObserver, ShutdownObserver, SubChannel};
use crate::utils::error::{BusError, Result};

pub type QueueName = String;

pub const FANOUT: &str = "fanout";

/// An exchange and the queues bound to it.
#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: String,
    pub bindings: HashSet<QueueName>,
}

impl Exchange {
    pub fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            bindings: HashSet::new(),
        }
    }

    /// Binding a queue twice has no effect.
    pub fn bind(&mut self, queue: QueueName) {
        self.bindings.insert(queue);
    }

    pub fn unbind(&mut self, queue: &QueueName) {
        self.bindings.remove(queue);
    }
}

#[derive(Debug)]
struct Queue {
    /// Connection that declared the queue; the queue goes away with it.
    owner: u64,
    sender: UnboundedSender<Vec<u8>>,
    receiver: Option<UnboundedReceiver<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct Topology {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<QueueName, Queue>,
}

/// One successful publish as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub channel_id: u64,
    pub exchange: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
struct Stats {
    channel_ids: Vec<u64>,
    open_channels: usize,
    max_open_channels: usize,
    publishes: Vec<PublishRecord>,
    consumers: Vec<QueueName>,
}

#[derive(Default)]
pub struct MemoryBroker {
    topology: Mutex<Topology>,
    stats: Mutex<Stats>,
    connections: Mutex<Vec<Arc<ConnectionShared>>>,
    next_id: AtomicU64,
    refuse_connections: AtomicBool,
    reject_exchange_declare: AtomicBool,
    fail_publish: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following `connect` fail as if the broker were unreachable.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Makes every following exchange declaration fail with a precondition
    /// error.
    pub fn reject_exchange_declare(&self, reject: bool) {
        self.reject_exchange_declare.store(reject, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Declares an exchange of an arbitrary kind, as another application
    /// sharing the broker would.
    pub fn declare_exchange(&self, name: &str, kind: &str) {
        lock(&self.topology)
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| Exchange::new(name, kind));
    }

    /// Drops every open connection as a network failure would. Consumers see
    /// an error on their delivery stream; shutdown observers are notified.
    pub fn sever_connections(&self) {
        let connections: Vec<_> = lock(&self.connections).drain(..).collect();
        for conn in connections {
            conn.shutdown(self, true, "connection severed by broker");
        }
    }

    /// Total number of sub-channels ever opened.
    pub fn channels_opened(&self) -> usize {
        lock(&self.stats).channel_ids.len()
    }

    pub fn channel_ids(&self) -> Vec<u64> {
        lock(&self.stats).channel_ids.clone()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.stats).open_channels
    }

    /// Highest number of sub-channels that were open at the same time.
    pub fn max_open_channels(&self) -> usize {
        lock(&self.stats).max_open_channels
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        lock(&self.stats).publishes.clone()
    }

    /// Queues that had a consumer attached, in attach order.
    pub fn consumers(&self) -> Vec<QueueName> {
        lock(&self.stats).consumers.clone()
    }

    pub fn bindings(&self, exchange: &str) -> Vec<QueueName> {
        lock(&self.topology)
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<String> {
        lock(&self.topology)
            .exchanges
            .get(exchange)
            .map(|e| e.kind.clone())
    }

    pub fn queue_count(&self) -> usize {
        lock(&self.topology).queues.len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn channel_opened(&self, id: u64) {
        let mut stats = lock(&self.stats);
        stats.channel_ids.push(id);
        stats.open_channels += 1;
        stats.max_open_channels = stats.max_open_channels.max(stats.open_channels);
    }

    fn channel_released(&self) {
        let mut stats = lock(&self.stats);
        stats.open_channels = stats.open_channels.saturating_sub(1);
    }

    /// Deletes the exclusive queues of a connection and their bindings.
    fn drop_queues_of(&self, connection_id: u64) {
        let mut topology = lock(&self.topology);
        let owned: Vec<QueueName> = topology
            .queues
            .iter()
            .filter(|(_, q)| q.owner == connection_id)
            .map(|(name, _)| name.clone())
            .collect();

        for name in owned {
            topology.queues.remove(&name);
            for exchange in topology.exchanges.values_mut() {
                exchange.unbind(&name);
            }
            trace!(queue = %name, "auto-deleted queue");
        }
    }

    fn declare_fanout(&self, exchange: &str) -> Result<()> {
        if self.reject_exchange_declare.load(Ordering::SeqCst) {
            return Err(BusError::Broker(format!(
                "PRECONDITION_FAILED - exchange '{exchange}' declaration rejected"
            )));
        }

        let mut topology = lock(&self.topology);
        let entry = topology
            .exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| Exchange::new(exchange, FANOUT));

        if entry.kind != FANOUT {
            return Err(BusError::Broker(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{exchange}': \
                 received 'fanout' but current is '{}'",
                entry.kind
            )));
        }
        Ok(())
    }

    fn declare_queue(&self, owner: u64) -> QueueName {
        let name = format!("amq.gen-{}", uuid::Uuid::new_v4().simple());
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.topology).queues.insert(
            name.clone(),
            Queue {
                owner,
                sender,
                receiver: Some(receiver),
            },
        );
        name
    }

    fn bind(&self, queue: &str, exchange: &str) -> Result<()> {
        let mut topology = lock(&self.topology);
        if !topology.queues.contains_key(queue) {
            return Err(BusError::Broker(format!("NOT_FOUND - no queue '{queue}'")));
        }
        match topology.exchanges.get_mut(exchange) {
            Some(e) => {
                e.bind(queue.to_string());
                Ok(())
            }
            None => Err(BusError::Broker(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            ))),
        }
    }

    /// Delivers `body` to every queue bound to `exchange`.
    fn route(&self, channel_id: u64, exchange: &str, body: &[u8]) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Broker("publish rejected by broker".to_string()));
        }

        {
            let topology = lock(&self.topology);
            let Some(target) = topology.exchanges.get(exchange) else {
                return Err(BusError::Broker(format!(
                    "NOT_FOUND - no exchange '{exchange}'"
                )));
            };

            for queue_name in &target.bindings {
                if let Some(queue) = topology.queues.get(queue_name) {
                    if queue.sender.send(body.to_vec()).is_err() {
                        debug!(queue = %queue_name, "queue consumer is gone, message dropped");
                    }
                }
            }
        }

        lock(&self.stats).publishes.push(PublishRecord {
            channel_id,
            exchange: exchange.to_string(),
            body: body.to_vec(),
        });
        Ok(())
    }

    fn take_consumer(&self, queue: &str) -> Result<UnboundedReceiver<Vec<u8>>> {
        let receiver = {
            let mut topology = lock(&self.topology);
            let Some(q) = topology.queues.get_mut(queue) else {
                return Err(BusError::Broker(format!("NOT_FOUND - no queue '{queue}'")));
            };
            q.receiver.take().ok_or_else(|| {
                BusError::Broker(format!(
                    "ACCESS_REFUSED - queue '{queue}' in exclusive use"
                ))
            })?
        };
        lock(&self.stats).consumers.push(queue.to_string());
        Ok(receiver)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topology", &lock(&self.topology))
            .field("stats", &lock(&self.stats))
            .finish()
    }
}

/// [`Connector`] for a shared [`MemoryBroker`]. The URI is only used in
/// error messages.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connection>> {
        if self.broker.refuse_connections.load(Ordering::SeqCst) {
            return Err(BusError::Connect {
                uri: uri.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let shared = Arc::new(ConnectionShared {
            id: self.broker.next_id(),
            open: AtomicBool::new(true),
            severed: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
            error_observers: Mutex::new(Vec::new()),
            shutdown_observers: Mutex::new(Vec::new()),
        });
        lock(&self.broker.connections).push(shared.clone());
        debug!(connection_id = shared.id, "memory broker connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            shared,
        }))
    }
}

struct ConnectionShared {
    id: u64,
    open: AtomicBool,
    severed: Arc<AtomicBool>,
    closed: CancellationToken,
    error_observers: Mutex<Vec<ErrorObserver>>,
    shutdown_observers: Mutex<Vec<ShutdownObserver>>,
}

impl ConnectionShared {
    fn shutdown(&self, broker: &MemoryBroker, severed: bool, cause: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.severed.store(severed, Ordering::SeqCst);
        self.closed.cancel();
        broker.drop_queues_of(self.id);

        if severed {
            let err = BusError::Broker(cause.to_string());
            for observer in lock(&self.error_observers).iter() {
                observer(&err);
            }
        }
        for observer in lock(&self.shutdown_observers).iter() {
            observer(cause);
        }
    }
}

pub struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Box<dyn SubChannel>> {
        if !self.is_open() {
            return Err(BusError::NotConnected);
        }

        let id = self.broker.next_id();
        self.broker.channel_opened(id);
        trace!(channel_id = id, "memory broker sub-channel opened");

        Ok(Box::new(MemoryChannel {
            id,
            connection_id: self.shared.id,
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            closed: self.shared.closed.child_token(),
            severed: self.shared.severed.clone(),
            error_observers: Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<()> {
        lock(&self.broker.connections).retain(|c| c.id != self.shared.id);
        self.shared.shutdown(&self.broker, false, "closed by application");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn on_error(&self, observer: ErrorObserver) {
        lock(&self.shared.error_observers).push(observer);
    }

    fn on_shutdown(&self, observer: ShutdownObserver) {
        lock(&self.shared.shutdown_observers).push(observer);
    }
}

pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    broker: Arc<MemoryBroker>,
    open: AtomicBool,
    closed: CancellationToken,
    severed: Arc<AtomicBool>,
    error_observers: Mutex<Vec<ErrorObserver>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BusError::ChannelClosed(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }

    /// A channel-level protocol error closes the channel, as in AMQP.
    fn fail(&self, err: BusError) -> BusError {
        self.closed.cancel();
        for observer in lock(&self.error_observers).iter() {
            observer(&err);
        }
        err
    }
}

#[async_trait]
impl SubChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn on_error(&self, observer: ErrorObserver) {
        lock(&self.error_observers).push(observer);
    }

    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .declare_fanout(exchange)
            .map_err(|e| self.fail(e))
    }

    async fn declare_anonymous_queue(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.broker.declare_queue(self.connection_id))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, _routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.bind(queue, exchange).map_err(|e| self.fail(e))
    }

    async fn publish(&self, exchange: &str, _routing_key: &str, body: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .route(self.id, exchange, body)
            .map_err(|e| self.fail(e))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let receiver = self.broker.take_consumer(queue).map_err(|e| self.fail(e))?;

        let state = ConsumerState {
            receiver,
            closed: self.closed.clone(),
            severed: self.severed.clone(),
            finished: false,
        };
        Ok(futures::stream::unfold(state, next_delivery).boxed())
    }

    async fn close(&self) -> Result<()> {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        if was_open {
            self.broker.channel_released();
        }
        if !was_open || self.closed.is_cancelled() {
            self.closed.cancel();
            return Err(BusError::ChannelClosed(format!(
                "channel {} was already closed",
                self.id
            )));
        }
        self.closed.cancel();
        trace!(channel_id = self.id, "memory broker sub-channel closed");
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.channel_released();
        }
    }
}

struct ConsumerState {
    receiver: UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
    severed: Arc<AtomicBool>,
    finished: bool,
}

async fn next_delivery(mut state: ConsumerState) -> Option<(Result<Vec<u8>>, ConsumerState)> {
    if state.finished {
        return None;
    }

    let delivery = tokio::select! {
        biased;
        _ = state.closed.cancelled() => None,
        body = state.receiver.recv() => body,
    };

    match delivery {
        Some(body) => Some((Ok(body), state)),
        None if state.severed.load(Ordering::SeqCst) => {
            state.finished = true;
            let err = BusError::ChannelClosed("connection severed by broker".to_string());
            Some((Err(err), state))
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_bind_and_unbind() {
        let mut exchange = Exchange::new("bus", FANOUT);
        exchange.bind("q1".to_string());
        exchange.bind("q1".to_string());
        assert_eq!(exchange.bindings.len(), 1);
        exchange.unbind(&"q1".to_string());
        assert!(exchange.bindings.is_empty());
    }

    #[tokio::test]
    async fn fanout_reaches_every_bound_queue() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker.clone());
        let conn = connector.connect("memory://").await.unwrap();
        let channel = conn.create_channel().await.unwrap();

        channel.declare_fanout_exchange("bus").await.unwrap();
        let q1 = channel.declare_anonymous_queue().await.unwrap();
        let q2 = channel.declare_anonymous_queue().await.unwrap();
        assert_ne!(q1, q2);
        channel.bind_queue(&q1, "bus", "").await.unwrap();
        channel.bind_queue(&q2, "bus", "").await.unwrap();

        let mut s1 = channel.consume(&q1).await.unwrap();
        let consumer = conn.create_channel().await.unwrap();
        let mut s2 = consumer.consume(&q2).await.unwrap();

        channel.publish("bus", "", b"hello").await.unwrap();
        assert_eq!(s1.next().await.unwrap().unwrap(), b"hello".to_vec());
        assert_eq!(s2.next().await.unwrap().unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn declaring_fanout_twice_is_a_no_op() {
        let broker = MemoryBroker::new();
        let conn = MemoryConnector::new(broker.clone())
            .connect("memory://")
            .await
            .unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.declare_fanout_exchange("bus").await.unwrap();
        channel.declare_fanout_exchange("bus").await.unwrap();
        assert_eq!(broker.exchange_kind("bus").as_deref(), Some(FANOUT));
    }

    #[tokio::test]
    async fn exchange_type_conflict_closes_the_channel() {
        let broker = MemoryBroker::new();
        broker.declare_exchange("bus", "direct");
        let conn = MemoryConnector::new(broker.clone())
            .connect("memory://")
            .await
            .unwrap();
        let channel = conn.create_channel().await.unwrap();

        let err = channel.declare_fanout_exchange("bus").await.unwrap_err();
        assert!(err.to_string().contains("PRECONDITION_FAILED"));
        assert!(channel.declare_anonymous_queue().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn closing_a_connection_deletes_its_queues() {
        let broker = MemoryBroker::new();
        let conn = MemoryConnector::new(broker.clone())
            .connect("memory://")
            .await
            .unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.declare_fanout_exchange("bus").await.unwrap();
        let queue = channel.declare_anonymous_queue().await.unwrap();
        channel.bind_queue(&queue, "bus", "").await.unwrap();
        assert_eq!(broker.queue_count(), 1);

        conn.close().await.unwrap();
        assert_eq!(broker.queue_count(), 0);
        assert!(broker.bindings("bus").is_empty());
        assert!(!conn.is_open());
        // Second close is fine
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_channel_count_tracks_close_and_drop() {
        let broker = MemoryBroker::new();
        let conn = MemoryConnector::new(broker.clone())
            .connect("memory://")
            .await
            .unwrap();

        let a = conn.create_channel().await.unwrap();
        let b = conn.create_channel().await.unwrap();
        assert_eq!(broker.open_channels(), 2);

        a.close().await.unwrap();
        assert!(a.close().await.unwrap_err().is_closed());
        drop(b);

        assert_eq!(broker.open_channels(), 0);
        assert_eq!(broker.max_open_channels(), 2);
        assert_eq!(broker.channels_opened(), 2);
    }

    #[tokio::test]
    async fn severing_reports_an_error_to_consumers() {
        let broker = MemoryBroker::new();
        let conn = MemoryConnector::new(broker.clone())
            .connect("memory://")
            .await
            .unwrap();
        let channel = conn.create_channel().await.unwrap();
        let queue = channel.declare_anonymous_queue().await.unwrap();
        let mut deliveries = channel.consume(&queue).await.unwrap();

        let shutdowns = Arc::new(Mutex::new(Vec::new()));
        let seen = shutdowns.clone();
        conn.on_shutdown(Box::new(move |cause: &str| {
            seen.lock().unwrap().push(cause.to_string())
        }));

        broker.sever_connections();

        assert!(deliveries.next().await.unwrap().is_err());
        assert!(deliveries.next().await.is_none());
        assert_eq!(
            *shutdowns.lock().unwrap(),
            vec!["connection severed by broker".to_string()]
        );
        assert!(conn.create_channel().await.is_err());
    }

    #[tokio::test]
    async fn refused_connection_reports_the_uri() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let err = match MemoryConnector::new(broker).connect("amqp://nowhere:5672").await {
            Err(e) => e,
            Ok(_) => panic!("connection should be refused"),
        };
        assert!(err.to_string().contains("amqp://nowhere:5672"));
    }
}
