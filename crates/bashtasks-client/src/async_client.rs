use crate::{ClientError, Result};
use bashtasks_core::{Destination, TaskRequest, TaskResponse};
use bashtasks_transport::{BrokerConfig, Session, Transport};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Pause after handing back a response that belongs to someone else
const FOREIGN_RESPONSE_BACKOFF: Duration = Duration::from_millis(10);

/// Async producer client.
///
/// Requests go out over one long-lived session. Each `execute*` call waits
/// on a session of its own so that closing it hands any message it was
/// holding back to the broker.
pub struct BashTasksClient {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    session: Arc<dyn Session>,
    responses: Destination,
    declared: Mutex<HashSet<Destination>>,
}

impl BashTasksClient {
    /// Connect and declare the standard request and response destinations
    pub async fn connect(transport: Arc<dyn Transport>, config: BrokerConfig) -> Result<Self> {
        let session = transport.connect(&config).await?;
        let requests = Destination::requests();
        let responses = Destination::responses();
        session.declare(&[requests.clone(), responses.clone()]).await?;

        debug!(broker = %config.redacted_uri(), transport = transport.name(), "Client connected");

        Ok(BashTasksClient {
            transport,
            config,
            session,
            declared: Mutex::new([requests, responses.clone()].into_iter().collect()),
            responses,
        })
    }

    /// Build a request for `command` and publish it without waiting.
    pub async fn post<I, S>(
        &self,
        command: I,
        max_retries: Option<u32>,
        destination: &Destination,
    ) -> Result<TaskRequest>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = TaskRequest::builder(command).max_retries(max_retries).build()?;
        self.post_request(&request, destination).await?;
        Ok(request)
    }

    pub async fn post_request(&self, request: &TaskRequest, destination: &Destination) -> Result<()> {
        self.ensure_declared(destination).await?;
        self.session
            .publish(destination, &request.to_bytes()?, true)
            .await?;

        debug!(
            correlation_id = %request.correlation_id,
            destination = %destination,
            command = ?request.command,
            "Posted task"
        );
        Ok(())
    }

    /// Post `command` and wait for its final response.
    pub async fn execute<I, S>(
        &self,
        command: I,
        max_retries: Option<u32>,
        destination: &Destination,
    ) -> Result<TaskResponse>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = TaskRequest::builder(command).max_retries(max_retries).build()?;
        self.execute_request(&request, destination).await
    }

    pub async fn execute_request(&self, request: &TaskRequest, destination: &Destination) -> Result<TaskResponse> {
        self.round_trip(request, destination, None).await
    }

    /// Like [`execute_request`](Self::execute_request), giving up after
    /// `timeout`. The request itself stays queued.
    pub async fn execute_timeout(
        &self,
        request: &TaskRequest,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<TaskResponse> {
        self.round_trip(request, destination, Some(timeout)).await
    }

    pub async fn close(&self) -> Result<()> {
        self.session.close().await?;
        Ok(())
    }

    async fn ensure_declared(&self, destination: &Destination) -> Result<()> {
        if self.declared.lock().contains(destination) {
            return Ok(());
        }
        self.session.declare(std::slice::from_ref(destination)).await?;
        self.declared.lock().insert(destination.clone());
        Ok(())
    }

    async fn round_trip(
        &self,
        request: &TaskRequest,
        destination: &Destination,
        timeout: Option<Duration>,
    ) -> Result<TaskResponse> {
        let session = self.transport.connect(&self.config).await?;

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.await_response(session.as_ref(), request, destination))
                .await
                .unwrap_or_else(|_| Err(ClientError::Timeout(request.correlation_id.clone()))),
            None => self.await_response(session.as_ref(), request, destination).await,
        };

        if let Err(e) = session.close().await {
            debug!(error = %e, "Failed to close response session");
        }
        waited
    }

    async fn await_response(
        &self,
        session: &dyn Session,
        request: &TaskRequest,
        destination: &Destination,
    ) -> Result<TaskResponse> {
        let mut deliveries = session.consume(&self.responses, 1).await?;
        self.post_request(request, destination).await?;

        while let Some(delivery) = deliveries.next().await {
            let delivery = delivery?;

            match TaskResponse::from_bytes(&delivery.body) {
                Ok(response) if response.correlation_id() == &request.correlation_id => {
                    session.ack(delivery.tag).await?;
                    return Ok(response);
                }
                Ok(response) => {
                    trace!(
                        expected = %request.correlation_id,
                        got = %response.correlation_id(),
                        "Returning response for another producer"
                    );
                    session.reject(delivery.tag, true).await?;
                    tokio::time::sleep(FOREIGN_RESPONSE_BACKOFF).await;
                }
                Err(e) => {
                    warn!(error = %e, "Dead-lettering undecodable response");
                    session.reject(delivery.tag, false).await?;
                }
            }
        }

        Err(ClientError::StreamEnded(request.correlation_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bashtasks_transport::{AmqpTransport, MemoryBroker};

    #[tokio::test]
    async fn test_post_publishes_request() {
        let broker = MemoryBroker::new();
        let client = BashTasksClient::connect(Arc::new(broker.clone()), BrokerConfig::default())
            .await
            .unwrap();

        let request = client
            .post(["ls", "-la"], Some(3), &Destination::requests())
            .await
            .unwrap();

        let queued = broker.drain(Destination::requests().queue());
        assert_eq!(queued.len(), 1);
        let received = TaskRequest::from_bytes(&queued[0]).unwrap();
        assert_eq!(received, request);
        assert_eq!(received.command, vec!["ls", "-la"]);
        assert_eq!(received.max_retries, Some(3));
        assert_eq!(received.retries, 0);
    }

    #[tokio::test]
    async fn test_post_declares_custom_destination() {
        let broker = MemoryBroker::new();
        let client = BashTasksClient::connect(Arc::new(broker.clone()), BrokerConfig::default())
            .await
            .unwrap();
        let custom = Destination::named("bashtasks:pool:gpu");

        client.post(["nvidia-smi"], None, &custom).await.unwrap();
        client.post(["nvidia-smi"], None, &custom).await.unwrap();

        assert_eq!(broker.queue_len(custom.queue()), 2);
        assert_eq!(broker.queue_len(Destination::requests().queue()), 0);
    }

    #[tokio::test]
    async fn test_post_rejects_empty_command() {
        let client = BashTasksClient::connect(Arc::new(MemoryBroker::new()), BrokerConfig::default())
            .await
            .unwrap();
        let result = client.post(Vec::<String>::new(), None, &Destination::requests()).await;
        assert!(matches!(result, Err(ClientError::Envelope(_))));
    }

    #[tokio::test]
    async fn test_execute_timeout_leaves_request_queued() {
        let broker = MemoryBroker::new();
        let client = BashTasksClient::connect(Arc::new(broker.clone()), BrokerConfig::default())
            .await
            .unwrap();
        let request = TaskRequest::builder(["true"]).build().unwrap();

        let result = client
            .execute_timeout(&request, &Destination::requests(), Duration::from_millis(50))
            .await;

        match result {
            Err(ClientError::Timeout(id)) => assert_eq!(id, request.correlation_id),
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert_eq!(broker.queue_len(Destination::requests().queue()), 1);
        // Only the publishing session is left open
        assert_eq!(broker.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_refuses_posts() {
        let client = BashTasksClient::connect(Arc::new(MemoryBroker::new()), BrokerConfig::default())
            .await
            .unwrap();
        client.close().await.unwrap();

        let result = client.post(["true"], None, &Destination::requests()).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn test_amqp_post() {
        let client = BashTasksClient::connect(Arc::new(AmqpTransport), BrokerConfig::default())
            .await
            .unwrap();
        client.post(["true"], Some(0), &Destination::requests()).await.unwrap();
        client.close().await.unwrap();
    }
}
