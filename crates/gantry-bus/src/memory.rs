//! In-process message bus.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::Acknowledger;
use crate::bus::Delivery;
use crate::bus::DeliveryToken;
use crate::bus::MessageBus;
use crate::bus::Publisher;
use crate::bus::Subscription;
use crate::error::Result;

/// In-process bus with durable-queue semantics scoped to the process.
///
/// Messages published to a queue with no subscriber are buffered and handed
/// over when a subscription attaches. Every delivery gets an entry in a
/// per-queue ack ledger, so tests can assert exactly-one-ack per delivery.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<Vec<u8>>,
    subscriber: Option<mpsc::UnboundedSender<Delivery>>,
    published: Vec<Vec<u8>>,
    acks: Vec<Arc<AtomicUsize>>,
}

impl QueueState {
    fn mint_delivery(&mut self, payload: Vec<u8>, redelivered: bool) -> Delivery {
        let acked = Arc::new(AtomicUsize::new(0));
        self.acks.push(acked.clone());
        let token = DeliveryToken::new(Box::new(MemoryAck { acked }));
        Delivery::new(payload, redelivered, token)
    }

    fn push(&mut self, payload: Vec<u8>) {
        self.published.push(payload.clone());
        // Hand straight to the live subscriber, otherwise buffer.
        let live = self.subscriber.as_ref().is_some_and(|tx| !tx.is_closed());
        if live {
            let delivery = self.mint_delivery(payload.clone(), false);
            let sent = self.subscriber.as_ref().is_some_and(|tx| tx.send(delivery).is_ok());
            if sent {
                return;
            }
            self.subscriber = None;
            self.acks.pop();
        }
        self.backlog.push_back(payload);
    }
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// All payloads ever published to `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        inner.queues.get(queue).map(|q| q.published.clone()).unwrap_or_default()
    }

    /// Ack counts for the deliveries minted on `queue`, in delivery order.
    pub fn ack_counts(&self, queue: &str) -> Vec<usize> {
        let inner = self.inner.lock();
        inner
            .queues
            .get(queue)
            .map(|q| q.acks.iter().map(|a| a.load(Ordering::SeqCst)).collect())
            .unwrap_or_default()
    }

    /// Number of messages buffered on `queue` with no subscriber attached.
    pub fn backlog_len(&self, queue: &str) -> usize {
        let inner = self.inner.lock();
        inner.queues.get(queue).map(|q| q.backlog.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn publisher(&self, queue: &str) -> Result<Box<dyn Publisher>> {
        let mut inner = self.inner.lock();
        inner.queues.entry(queue.to_string()).or_default();
        Ok(Box::new(MemoryPublisher {
            queue: queue.to_string(),
            inner: self.inner.clone(),
        }))
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let state = inner.queues.entry(queue.to_string()).or_default();
        // Drain anything buffered before the subscriber attached.
        while let Some(payload) = state.backlog.pop_front() {
            let delivery = state.mint_delivery(payload, false);
            let _ = tx.send(delivery);
        }
        state.subscriber = Some(tx);
        debug!(queue, "subscription attached");
        Ok(Box::new(MemorySubscription {
            queue: queue.to_string(),
            inner: self.inner.clone(),
            rx,
            cancelled: false,
        }))
    }
}

struct MemoryPublisher {
    queue: String,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.queues.entry(self.queue.clone()).or_default();
        state.push(payload.to_vec());
        Ok(())
    }
}

struct MemorySubscription {
    queue: String,
    inner: Arc<Mutex<Inner>>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    cancelled: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    async fn cancel(&mut self) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        {
            let mut inner = self.inner.lock();
            if let Some(state) = inner.queues.get_mut(&self.queue) {
                state.subscriber = None;
            }
        }
        // Buffered deliveries remain readable until the channel drains.
        self.rx.close();
        debug!(queue = %self.queue, "subscription cancelled");
        Ok(())
    }
}

struct MemoryAck {
    acked: Arc<AtomicUsize>,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backlog_drains_on_subscribe() {
        let bus = MemoryBus::new();
        let publisher = bus.publisher("jobs").await.unwrap();
        publisher.publish(b"one").await.unwrap();
        publisher.publish(b"two").await.unwrap();
        assert_eq!(bus.backlog_len("jobs"), 2);

        let mut sub = bus.subscribe("jobs").await.unwrap();
        assert_eq!(bus.backlog_len("jobs"), 0);

        let first = sub.next().await.unwrap();
        assert_eq!(first.payload(), b"one");
        let second = sub.next().await.unwrap();
        assert_eq!(second.payload(), b"two");
    }

    #[tokio::test]
    async fn test_ack_ledger_counts_once_per_delivery() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("jobs").await.unwrap();
        bus.publisher("jobs").await.unwrap().publish(b"payload").await.unwrap();

        let delivery = sub.next().await.unwrap();
        assert_eq!(bus.ack_counts("jobs"), vec![0]);
        delivery.ack().await.unwrap();
        assert_eq!(bus.ack_counts("jobs"), vec![1]);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_drains_buffered() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("jobs").await.unwrap();
        let publisher = bus.publisher("jobs").await.unwrap();
        publisher.publish(b"buffered").await.unwrap();

        sub.cancel().await.unwrap();
        sub.cancel().await.unwrap();

        // The delivery that was already in flight drains, then the stream ends.
        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.payload(), b"buffered");
        assert!(sub.next().await.is_none());

        // Publishes after cancellation buffer for the next subscriber.
        publisher.publish(b"later").await.unwrap();
        assert_eq!(bus.backlog_len("jobs"), 1);
    }

    #[tokio::test]
    async fn test_published_records_every_payload() {
        let bus = MemoryBus::new();
        let publisher = bus.publisher("logs").await.unwrap();
        publisher.publish(b"a").await.unwrap();
        publisher.publish(b"b").await.unwrap();
        assert_eq!(bus.published("logs"), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
