//! In-process broker with AMQP-like semantics.
//!
//! Exchanges fan out to every bound queue, consumers respect their prefetch
//! window, and closing a session puts its unacknowledged messages back at the
//! head of their queues flagged as redelivered. Rejecting without requeue
//! moves the message to the queue's dead-letter list.

use crate::{BrokerConfig, Deliveries, Delivery, DeliveryTag, Result, Session, Transport, TransportError};
use async_trait::async_trait;
use bashtasks_core::Destination;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    ready: VecDeque<StoredMessage>,
    dead_letters: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    /// exchange -> bound queues
    bindings: HashMap<String, HashSet<String>>,
    queues: HashMap<String, MemoryQueue>,
}

#[derive(Default)]
struct BrokerState {
    inner: Mutex<BrokerInner>,
    /// Woken on every publish, settle and close
    changed: Notify,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    refuse_connections: AtomicBool,
}

impl BrokerState {
    fn wake_consumers(&self) {
        self.changed.notify_waiters();
    }
}

/// Shared handle to an in-process broker. Clones see the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session directly, without going through [`Transport`]
    pub fn session(&self) -> Arc<MemorySession> {
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(MemorySession {
            broker: self.state.clone(),
            state: Arc::new(SessionState::default()),
        })
    }

    /// Make subsequent `connect` calls fail, as an unreachable broker would
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Messages waiting in `queue` (not counting unacknowledged ones)
    pub fn queue_len(&self, queue: &str) -> usize {
        let inner = self.state.inner.lock();
        inner.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Remove and return every waiting message of `queue`
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut inner = self.state.inner.lock();
        inner
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        let inner = self.state.inner.lock();
        inner
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions_opened() - self.state.sessions_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, _config: &BrokerConfig) -> Result<Arc<dyn Session>> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("in-memory broker refused the connection".to_string()));
        }
        let session: Arc<dyn Session> = self.session();
        Ok(session)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    body: Vec<u8>,
}

#[derive(Default)]
struct SessionState {
    closed: CancellationToken,
    /// Ordered by tag so redelivery keeps the original order
    unacked: Mutex<BTreeMap<DeliveryTag, Unacked>>,
    next_tag: AtomicU64,
    peak_unacked: AtomicUsize,
}

pub struct MemorySession {
    broker: Arc<BrokerState>,
    state: Arc<SessionState>,
}

impl MemorySession {
    /// Highest number of messages this session ever held unacknowledged
    pub fn peak_unacked(&self) -> usize {
        self.state.peak_unacked.load(Ordering::SeqCst)
    }

    pub fn unacked(&self) -> usize {
        self.state.unacked.lock().len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.closed.is_cancelled() {
            Err(TransportError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn take_unacked(&self, tag: DeliveryTag) -> Result<Unacked> {
        self.state
            .unacked
            .lock()
            .remove(&tag)
            .ok_or(TransportError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare(&self, destinations: &[Destination]) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.broker.inner.lock();
        for destination in destinations {
            inner
                .bindings
                .entry(destination.exchange().to_string())
                .or_default()
                .insert(destination.queue().to_string());
            inner.queues.entry(destination.queue().to_string()).or_default();
        }
        Ok(())
    }

    async fn publish(&self, destination: &Destination, payload: &[u8], _persistent: bool) -> Result<()> {
        self.ensure_open()?;
        {
            let mut inner = self.broker.inner.lock();
            let BrokerInner { bindings, queues } = &mut *inner;
            match bindings.get(destination.exchange()) {
                Some(bound) => {
                    for queue in bound {
                        queues.entry(queue.clone()).or_default().ready.push_back(StoredMessage {
                            body: payload.to_vec(),
                            redelivered: false,
                        });
                    }
                }
                None => trace!(exchange = destination.exchange(), "Dropping unroutable message"),
            }
        }
        self.broker.wake_consumers();
        Ok(())
    }

    async fn consume(&self, destination: &Destination, prefetch: u16) -> Result<Deliveries> {
        self.ensure_open()?;
        let consumer = MemoryConsumer {
            broker: self.broker.clone(),
            session: self.state.clone(),
            queue: destination.queue().to_string(),
            prefetch: usize::from(prefetch.max(1)),
        };

        let deliveries = futures::stream::unfold(consumer, |consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((Ok::<_, TransportError>(delivery), consumer))
        });

        Ok(Box::pin(deliveries))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_open()?;
        self.take_unacked(tag)?;
        self.broker.wake_consumers();
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        let message = self.take_unacked(tag)?;
        {
            let mut inner = self.broker.inner.lock();
            let queue = inner.queues.entry(message.queue).or_default();
            if requeue {
                queue.ready.push_back(StoredMessage {
                    body: message.body,
                    redelivered: true,
                });
            } else {
                queue.dead_letters.push(message.body);
            }
        }
        self.broker.wake_consumers();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut inner = self.broker.inner.lock();
            let mut unacked = self.state.unacked.lock();
            if self.state.closed.is_cancelled() {
                return Ok(());
            }
            self.state.closed.cancel();
            self.broker.sessions_closed.fetch_add(1, Ordering::SeqCst);

            for (_, message) in std::mem::take(&mut *unacked).into_iter().rev() {
                inner
                    .queues
                    .entry(message.queue)
                    .or_default()
                    .ready
                    .push_front(StoredMessage {
                        body: message.body,
                        redelivered: true,
                    });
            }
        }
        self.broker.wake_consumers();
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.closed.is_cancelled()
    }
}

struct MemoryConsumer {
    broker: Arc<BrokerState>,
    session: Arc<SessionState>,
    queue: String,
    prefetch: usize,
}

impl MemoryConsumer {
    /// Wait for the next message; `None` once the session is closed
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            if self.session.closed.is_cancelled() {
                return None;
            }

            // Register for wake-ups before looking, so a publish in between is not missed
            let notified = self.broker.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_claim() {
                return Some(delivery);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.session.closed.cancelled() => return None,
            }
        }
    }

    fn try_claim(&self) -> Option<Delivery> {
        let mut inner = self.broker.inner.lock();
        let mut unacked = self.session.unacked.lock();
        if self.session.closed.is_cancelled() || unacked.len() >= self.prefetch {
            return None;
        }

        let message = inner.queues.get_mut(&self.queue)?.ready.pop_front()?;
        let tag = self.session.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        unacked.insert(
            tag,
            Unacked {
                queue: self.queue.clone(),
                body: message.body.clone(),
            },
        );
        self.session.peak_unacked.fetch_max(unacked.len(), Ordering::SeqCst);

        Some(Delivery {
            tag,
            body: message.body,
            redelivered: message.redelivered,
        })
    }
}
