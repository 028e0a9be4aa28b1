use crate::WorkerError;
use bashtasks_core::{Decision, Destination};
use bashtasks_transport::{DeliveryTag, Session};
use tracing::debug;

/// Publishes the outcome of an attempt and settles the inbound delivery.
#[derive(Debug, Clone)]
pub struct ResponseDispatcher {
    requests: Destination,
    responses: Destination,
}

impl ResponseDispatcher {
    pub fn new(requests: Destination, responses: Destination) -> Self {
        ResponseDispatcher { requests, responses }
    }

    pub fn requests(&self) -> &Destination {
        &self.requests
    }

    pub fn responses(&self) -> &Destination {
        &self.responses
    }

    /// Publish `decision` persistently, then ack `inbound`.
    ///
    /// The ack is only sent once the publish has been confirmed; if the
    /// publish fails the inbound message stays unacknowledged and the broker
    /// redelivers it when the session goes away.
    pub async fn dispatch(
        &self,
        session: &dyn Session,
        inbound: DeliveryTag,
        decision: &Decision,
    ) -> Result<&Destination, WorkerError> {
        let payload = decision.to_bytes()?;
        let destination = decision.destination(&self.requests, &self.responses);

        session.publish(destination, &payload, true).await?;
        session.ack(inbound).await?;

        debug!(
            destination = %destination,
            correlation_id = %decision.correlation_id(),
            retries = decision.retries(),
            "Dispatched"
        );

        Ok(destination)
    }
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        ResponseDispatcher::new(Destination::requests(), Destination::responses())
    }
}
