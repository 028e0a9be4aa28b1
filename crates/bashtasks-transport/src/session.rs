use crate::{BrokerConfig, Result};
use async_trait::async_trait;
use bashtasks_core::Destination;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Broker-assigned handle used to settle a delivery.
pub type DeliveryTag = u64;

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// Set when the broker handed this message out before without an ack
    pub redelivered: bool,
}

/// Deliveries of one consumer. The stream ends when its session closes.
pub type Deliveries = BoxStream<'static, Result<Delivery>>;

/// One broker session (an AMQP channel and its connection).
///
/// Every operation on a closed session fails with
/// [`TransportError::SessionClosed`](crate::TransportError::SessionClosed)
/// or the backend's equivalent error; nothing is retried here.
#[async_trait]
pub trait Session: Send + Sync {
    /// Declare the exchange/queue pair of each destination. Idempotent.
    async fn declare(&self, destinations: &[Destination]) -> Result<()>;

    async fn publish(&self, destination: &Destination, payload: &[u8], persistent: bool) -> Result<()>;

    /// Start consuming, holding at most `prefetch` unacknowledged messages
    async fn consume(&self, destination: &Destination, prefetch: u16) -> Result<Deliveries>;

    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// Refuse a delivery; without `requeue` it goes to the dead-letter queue
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Close the session. Unacknowledged deliveries are redelivered by the broker.
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Opens sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Session>>;

    fn name(&self) -> &'static str;
}
