//! Message-bus contracts for gantry workers.
//!
//! This crate defines the seam between a worker instance and the durable
//! message bus it consumes jobs from: a [`MessageBus`] hands out
//! per-queue [`Publisher`]s and manual-ack [`Subscription`]s, and every
//! [`Delivery`] carries a single-use [`DeliveryToken`].
//!
//! The production bus client lives outside this repository; [`MemoryBus`]
//! is the in-process implementation used by tests and local runs. It keeps
//! an ack ledger per queue so tests can assert that every delivery was
//! acknowledged exactly once.

#![warn(missing_docs)]

mod bus;
mod error;
mod memory;

pub use bus::Acknowledger;
pub use bus::Delivery;
pub use bus::DeliveryToken;
pub use bus::MessageBus;
pub use bus::Publisher;
pub use bus::Subscription;
pub use error::BusError;
pub use error::Result;
pub use memory::MemoryBus;
