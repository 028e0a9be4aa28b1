//! Broker access for bashtasks.
//!
//! The worker and the client only talk to the [`Transport`] and [`Session`]
//! traits. [`AmqpTransport`] speaks AMQP 0.9.1 through `lapin`;
//! [`MemoryBroker`] keeps everything in process and is what the test suites
//! run against.

mod session;
mod config;
pub mod amqp;
pub mod memory;

pub use session::{Deliveries, Delivery, DeliveryTag, Session, Transport};
pub use config::BrokerConfig;
pub use amqp::{AmqpSession, AmqpTransport};
pub use memory::{MemoryBroker, MemorySession};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to declare {destination}: {reason}")]
    Declare { destination: String, reason: String },

    #[error("Failed to publish to {destination}: {reason}")]
    Publish { destination: String, reason: String },

    #[error("Failed to consume from {destination}: {reason}")]
    Consume { destination: String, reason: String },

    #[error("Failed to settle delivery {tag}: {reason}")]
    Settle { tag: DeliveryTag, reason: String },

    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("Session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A worker holds at most this many unacknowledged messages.
pub const WORKER_PREFETCH: u16 = 1;
