//! Core bus traits and the delivery type.

use async_trait::async_trait;

use crate::error::Result;

/// A connection to a durable message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Declare a durable queue, creating it if absent. Idempotent.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    /// Open a publisher bound to `queue`.
    ///
    /// Each publisher gets its own channel and does not retry; retry policy
    /// belongs to the consumer side. A stall on one publisher must not
    /// block another.
    async fn publisher(&self, queue: &str) -> Result<Box<dyn Publisher>>;

    /// Begin a manual-ack subscription on `queue`.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>>;
}

/// Publishes payloads onto a single queue.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one payload. No retries on failure.
    async fn publish(&self, payload: &[u8]) -> Result<()>;
}

/// A manual-ack consumer bound to a single queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    ///
    /// Returns `None` once the subscription is cancelled and its buffered
    /// deliveries have drained, or when the bus connection is gone.
    async fn next(&mut self) -> Option<Delivery>;

    /// Cancel the subscription. Idempotent; a no-op when already cancelled.
    async fn cancel(&mut self) -> Result<()>;
}

/// One message instance from the bus.
///
/// Carries the raw payload, the broker's redelivery flag, and the token
/// that acknowledges this specific delivery.
pub struct Delivery {
    payload: Vec<u8>,
    redelivered: bool,
    token: DeliveryToken,
}

impl Delivery {
    /// Create a delivery. Used by bus implementations.
    pub fn new(payload: Vec<u8>, redelivered: bool, token: DeliveryToken) -> Self {
        Self {
            payload,
            redelivered,
            token,
        }
    }

    /// Raw message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the broker has delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge the delivery, consuming it.
    ///
    /// Consuming `self` makes a double ack unrepresentable.
    pub async fn ack(self) -> Result<()> {
        self.token.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Single-use handle that acknowledges one delivery.
pub struct DeliveryToken {
    inner: Box<dyn Acknowledger>,
}

impl DeliveryToken {
    /// Wrap an implementation-specific acknowledger.
    pub fn new(inner: Box<dyn Acknowledger>) -> Self {
        Self { inner }
    }

    /// Send the ack, consuming the token.
    pub async fn ack(self) -> Result<()> {
        self.inner.ack().await
    }
}

/// Implementation side of [`DeliveryToken`].
#[async_trait]
pub trait Acknowledger: Send {
    /// Acknowledge the delivery this token was minted for.
    async fn ack(self: Box<Self>) -> Result<()>;
}
