//! In-process broker implementing the transport traits.
//!
//! Queues are work queues: each message goes to exactly one consumer. Messages
//! published to a route nobody declared yet are kept until a consumer shows up.
//! Unacknowledged deliveries return to their queue when the connection they
//! were delivered on goes away.
//!
//! The broker can be told to fail connection attempts, fail publishes, or drop
//! every live connection, which makes it suitable for exercising reconnect and
//! recovery paths in tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use futures_util::stream;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    TransportError,
    transport::{
        Channel, Connection, Delivery, DeliveryStream, DeliveryTag, Transport, TransportResult,
    },
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct Queue {
    ready: Mutex<VecDeque<StoredMessage>>,
    dead_letters: Mutex<Vec<StoredMessage>>,
    published: AtomicU64,
    notify: Notify,
}

impl Queue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.ready).push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, mut message: StoredMessage) {
        message.redelivered = true;
        lock(&self.ready).push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<StoredMessage> {
        lock(&self.ready).pop_front()
    }
}

struct Unacked {
    queue: Arc<Queue>,
    message: StoredMessage,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct ConnectionState {
    token: CancellationToken,
    unacked: Mutex<HashMap<DeliveryTag, Unacked>>,
}

impl ConnectionState {
    fn shut(&self) {
        self.token.cancel();
        let pending: Vec<Unacked> = lock(&self.unacked).drain().map(|(_, u)| u).collect();
        for unacked in pending {
            unacked.queue.push_front(unacked.message);
        }
    }

    fn ensure_open(&self) -> TransportResult {
        if self.token.is_cancelled() {
            Err(TransportError::new("connection is closed"))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct Broker {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    connections: Mutex<Vec<Arc<ConnectionState>>>,
    connect_attempts: AtomicU32,
    failing_connects: AtomicU32,
    failing_publishes: AtomicU32,
    next_tag: AtomicU64,
}

impl Broker {
    fn queue(&self, name: &str) -> Arc<Queue> {
        lock(&self.queues).entry(name.to_string()).or_default().clone()
    }

    fn existing_queue(&self, name: &str) -> Option<Arc<Queue>> {
        lock(&self.queues).get(name).cloned()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Shared handle to an in-process broker. Clones talk to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.broker.failing_connects.store(count, Ordering::Release);
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.broker.failing_publishes.store(count, Ordering::Release);
    }

    /// Sever every live connection, as a network failure would.
    pub fn drop_connections(&self) {
        let connections: Vec<_> = lock(&self.broker.connections).drain(..).collect();
        for connection in connections {
            connection.shut();
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.broker.connect_attempts.load(Ordering::Acquire)
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.broker.connections).len()
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.broker
            .existing_queue(queue)
            .map_or(0, |q| lock(&q.ready).len())
    }

    /// Total number of messages ever published to `route`.
    pub fn published_count(&self, route: &str) -> u64 {
        self.broker
            .existing_queue(route)
            .map_or(0, |q| q.published.load(Ordering::Acquire))
    }

    /// Payloads of the messages waiting in `queue`, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.broker.existing_queue(queue).map_or_else(Vec::new, |q| {
            lock(&q.ready).iter().map(|m| m.payload.clone()).collect()
        })
    }

    /// Payloads rejected from `queue` without requeue.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.broker.existing_queue(queue).map_or_else(Vec::new, |q| {
            lock(&q.dead_letters)
                .iter()
                .map(|m| m.payload.clone())
                .collect()
        })
    }
}

impl Transport for InMemoryTransport {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> TransportResult<InMemoryConnection> {
        self.broker.connect_attempts.fetch_add(1, Ordering::AcqRel);
        if Broker::take_failure(&self.broker.failing_connects) {
            return Err(TransportError::new("connection refused"));
        }
        let state = Arc::new(ConnectionState::default());
        lock(&self.broker.connections).push(state.clone());
        Ok(InMemoryConnection {
            broker: self.broker.clone(),
            state,
        })
    }
}

pub struct InMemoryConnection {
    broker: Arc<Broker>,
    state: Arc<ConnectionState>,
}

impl Connection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn create_channel(&self) -> TransportResult<InMemoryChannel> {
        self.state.ensure_open()?;
        Ok(InMemoryChannel {
            broker: self.broker.clone(),
            connection: self.state.clone(),
        })
    }

    fn close_signal(&self) -> CancellationToken {
        self.state.token.clone()
    }

    fn is_open(&self) -> bool {
        !self.state.token.is_cancelled()
    }

    async fn close(&self) -> TransportResult {
        lock(&self.broker.connections).retain(|c| !Arc::ptr_eq(c, &self.state));
        self.state.shut();
        Ok(())
    }
}

pub struct InMemoryChannel {
    broker: Arc<Broker>,
    connection: Arc<ConnectionState>,
}

impl InMemoryChannel {
    fn settle(&self, tag: DeliveryTag) -> TransportResult<Unacked> {
        self.connection.ensure_open()?;
        lock(&self.connection.unacked)
            .remove(&tag)
            .ok_or_else(|| TransportError::new(format!("unknown delivery tag {}", tag.0)))
    }
}

impl Channel for InMemoryChannel {
    async fn declare_queue(&mut self, queue: &str) -> TransportResult {
        self.connection.ensure_open()?;
        self.broker.queue(queue);
        Ok(())
    }

    async fn publish(&mut self, route: &str, payload: Vec<u8>) -> TransportResult {
        self.connection.ensure_open()?;
        if Broker::take_failure(&self.broker.failing_publishes) {
            return Err(TransportError::new("publish rejected"));
        }
        let queue = self.broker.queue(route);
        queue.published.fetch_add(1, Ordering::AcqRel);
        queue.push_back(StoredMessage {
            routing_key: route.to_string(),
            payload,
            redelivered: false,
        });
        Ok(())
    }

    async fn consume(&mut self, queue: &str, prefetch: u16) -> TransportResult<DeliveryStream> {
        self.connection.ensure_open()?;
        let consumer = QueueConsumer {
            broker: self.broker.clone(),
            connection: self.connection.clone(),
            queue: self.broker.queue(queue),
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
        };
        let deliveries = stream::unfold(consumer, |consumer| async move {
            let delivery = consumer.next().await?;
            Some((Ok(delivery), consumer))
        });
        Ok(Box::pin(deliveries))
    }

    async fn ack(&mut self, tag: DeliveryTag) -> TransportResult {
        self.settle(tag).map(drop)
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> TransportResult {
        let Unacked { queue, message, .. } = self.settle(tag)?;
        if requeue {
            queue.push_front(message);
        } else {
            lock(&queue.dead_letters).push(message);
        }
        Ok(())
    }

    async fn close(self) -> TransportResult {
        Ok(())
    }
}

struct QueueConsumer {
    broker: Arc<Broker>,
    connection: Arc<ConnectionState>,
    queue: Arc<Queue>,
    permits: Arc<Semaphore>,
}

impl QueueConsumer {
    async fn next(&self) -> Option<Delivery> {
        let token = &self.connection.token;
        let permit = tokio::select! {
            _ = token.cancelled() => return None,
            permit = self.permits.clone().acquire_owned() => permit.ok()?,
        };

        loop {
            let notified = self.queue.notify.notified();
            if let Some(message) = self.queue.pop() {
                let mut unacked = lock(&self.connection.unacked);
                if token.is_cancelled() {
                    drop(unacked);
                    self.queue.push_front(message);
                    return None;
                }
                let tag = DeliveryTag(self.broker.next_tag.fetch_add(1, Ordering::AcqRel) + 1);
                let delivery = Delivery {
                    tag,
                    routing_key: message.routing_key.clone(),
                    payload: message.payload.clone(),
                    redelivered: message.redelivered,
                };
                unacked.insert(
                    tag,
                    Unacked {
                        queue: self.queue.clone(),
                        message,
                        _permit: permit,
                    },
                );
                return Some(delivery);
            }
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = notified => {}
            }
        }
    }
}
