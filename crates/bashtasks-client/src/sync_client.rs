use crate::async_client::BashTasksClient;
use crate::Result;
use bashtasks_core::{Destination, TaskRequest, TaskResponse};
use bashtasks_transport::{BrokerConfig, Transport};
use std::sync::Arc;
use std::time::Duration;

/// Blocking client (wraps the async client)
pub struct BashTasksSyncClient {
    runtime: tokio::runtime::Runtime,
    client: BashTasksClient,
}

impl BashTasksSyncClient {
    /// Connect to the broker. Must not be called from inside an async runtime.
    pub fn connect(transport: Arc<dyn Transport>, config: BrokerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Runtime::new()?;
        let client = runtime.block_on(BashTasksClient::connect(transport, config))?;

        Ok(BashTasksSyncClient { runtime, client })
    }

    pub fn post<I, S>(&self, command: I, max_retries: Option<u32>, destination: &Destination) -> Result<TaskRequest>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runtime.block_on(self.client.post(command, max_retries, destination))
    }

    pub fn post_request(&self, request: &TaskRequest, destination: &Destination) -> Result<()> {
        self.runtime.block_on(self.client.post_request(request, destination))
    }

    pub fn execute<I, S>(&self, command: I, max_retries: Option<u32>, destination: &Destination) -> Result<TaskResponse>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runtime.block_on(self.client.execute(command, max_retries, destination))
    }

    pub fn execute_request(&self, request: &TaskRequest, destination: &Destination) -> Result<TaskResponse> {
        self.runtime.block_on(self.client.execute_request(request, destination))
    }

    pub fn execute_timeout(
        &self,
        request: &TaskRequest,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<TaskResponse> {
        self.runtime
            .block_on(self.client.execute_timeout(request, destination, timeout))
    }

    pub fn close(&self) -> Result<()> {
        self.runtime.block_on(self.client.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bashtasks_transport::MemoryBroker;

    #[test]
    fn test_sync_post() {
        let broker = MemoryBroker::new();
        let client = BashTasksSyncClient::connect(Arc::new(broker.clone()), BrokerConfig::default()).unwrap();

        let request = client.post(["echo", "hi"], None, &Destination::requests()).unwrap();

        let queued = broker.drain(Destination::requests().queue());
        assert_eq!(TaskRequest::from_bytes(&queued[0]).unwrap(), request);
        client.close().unwrap();
    }

    #[test]
    fn test_sync_execute_timeout() {
        let client = BashTasksSyncClient::connect(Arc::new(MemoryBroker::new()), BrokerConfig::default()).unwrap();
        let request = TaskRequest::builder(["true"]).build().unwrap();

        let result = client.execute_timeout(&request, &Destination::requests(), Duration::from_millis(20));
        assert!(matches!(result, Err(crate::ClientError::Timeout(_))));
    }
}
