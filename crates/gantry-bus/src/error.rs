//! Error types for bus operations.

use snafu::Snafu;

/// Result type for bus operations.
pub type Result<T, E = BusError> = std::result::Result<T, E>;

/// Errors that can occur talking to the message bus.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BusError {
    /// The named queue does not exist.
    #[snafu(display("queue not found: {queue}"))]
    QueueNotFound {
        /// Queue that was requested.
        queue: String,
    },

    /// Publishing a message failed.
    #[snafu(display("publish to {queue} failed: {reason}"))]
    PublishFailed {
        /// Target queue.
        queue: String,
        /// Failure reason.
        reason: String,
    },

    /// Opening a subscription failed.
    #[snafu(display("subscribe to {queue} failed: {reason}"))]
    SubscribeFailed {
        /// Target queue.
        queue: String,
        /// Failure reason.
        reason: String,
    },

    /// Acknowledging a delivery failed.
    #[snafu(display("ack failed: {reason}"))]
    AckFailed {
        /// Failure reason.
        reason: String,
    },

    /// The connection to the bus is gone.
    #[snafu(display("bus connection closed"))]
    ConnectionClosed,
}
