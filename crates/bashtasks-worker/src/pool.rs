use crate::config::WorkerConfig;
use crate::dispatcher::ResponseDispatcher;
use crate::executor::CommandExecutor;
use crate::handler::CommandHandler;
use crate::shutdown::{ShutdownContext, ShutdownReason};
use crate::worker::{worker_name, TaskBudget, TaskProcessor, Worker, WorkerState};
use crate::WorkerError;
use bashtasks_core::{Destination, RetryPolicy};
use bashtasks_transport::{BrokerConfig, Session, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Runs `workers` independent consume loops until something stops the pool.
pub struct WorkerPool {
    config: WorkerConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn CommandHandler>,
    shutdown: Arc<ShutdownContext>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, transport: Arc<dyn Transport>) -> Self {
        WorkerPool {
            config,
            transport,
            handler: Arc::new(CommandExecutor::new()),
            shutdown: Arc::new(ShutdownContext::new()),
        }
    }

    /// Replace process spawning with a custom handler
    pub fn with_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn shutdown_context(&self) -> Arc<ShutdownContext> {
        self.shutdown.clone()
    }

    /// Start the workers and block until the pool is told to stop.
    ///
    /// Workers get `graceful_shutdown_timeout_secs` to finish after the
    /// trigger; stragglers are aborted, which kills their child processes.
    pub async fn run(&self) -> Result<ShutdownReason, WorkerError> {
        self.config.validate()?;

        let processor = Arc::new(TaskProcessor::new(
            self.handler.clone(),
            RetryPolicy::new(self.config.max_retries),
            ResponseDispatcher::new(self.config.request_destination(), Destination::responses()),
            self.config.verbose,
            self.config.ok_returncodes.clone(),
        ));

        info!(
            workers = self.config.workers,
            transport = self.transport.name(),
            broker = %self.config.broker.redacted_uri(),
            queue = %self.config.queue,
            max_retries = self.config.max_retries,
            "Starting worker pool"
        );

        let mut workers = JoinSet::new();
        for slot in 0..self.config.workers {
            workers.spawn(run_worker(
                slot,
                self.config.broker.clone(),
                TaskBudget::from_limit(self.config.tasks),
                self.transport.clone(),
                processor.clone(),
                self.shutdown.clone(),
            ));
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                joined = workers.join_next(), if !workers.is_empty() => {
                    if let Some(Err(e)) = joined {
                        error!(error = %e, "Worker task panicked");
                    }
                    if workers.is_empty() {
                        warn!("Every worker exited");
                        self.shutdown.trigger(ShutdownReason::AllWorkersExited).await;
                    }
                }
            }
        }

        let grace = Duration::from_secs(self.config.graceful_shutdown_timeout_secs);
        let drained = tokio::time::timeout(grace, drain(&mut workers)).await;
        if drained.is_err() {
            warn!(
                remaining = workers.len(),
                timeout_secs = self.config.graceful_shutdown_timeout_secs,
                "Workers did not stop in time, aborting"
            );
            workers.shutdown().await;
        }

        let reason = self.shutdown.reason().unwrap_or(ShutdownReason::Requested);
        info!(reason = %reason, "Worker pool stopped");
        Ok(reason)
    }
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker task panicked");
        }
    }
}

async fn run_worker(
    slot: usize,
    broker: BrokerConfig,
    budget: TaskBudget,
    transport: Arc<dyn Transport>,
    processor: Arc<TaskProcessor>,
    shutdown: Arc<ShutdownContext>,
) {
    let name = worker_name(slot);
    info!(worker = %name, tasks = ?budget.remaining(), ">> Starting executor");

    let session = match open_session(transport.as_ref(), &broker, &processor).await {
        Ok(session) => session,
        Err(e) => {
            error!(worker = %name, error = %e, "Worker failed to start");
            return;
        }
    };

    if !shutdown.register(slot, session.clone()).await {
        return;
    }

    let worker = Worker::new(
        WorkerState::new(slot, budget),
        session.clone(),
        processor,
        shutdown.clone(),
    );
    let result = worker.run().await;

    // Still registered unless a trigger already closed it
    if shutdown.deregister(slot).is_some() {
        if let Err(e) = session.close().await {
            debug!(worker = %name, error = %e, "Failed to close session");
        }
    }

    match result {
        Ok(state) => info!(worker = %name, processed = state.processed, "Worker stopped"),
        Err(e) if shutdown.is_triggered() => {
            info!(worker = %name, error = %e, "Worker interrupted by shutdown")
        }
        Err(e) => error!(worker = %name, error = %e, "Worker failed"),
    }
}

async fn open_session(
    transport: &dyn Transport,
    broker: &BrokerConfig,
    processor: &TaskProcessor,
) -> Result<Arc<dyn Session>, WorkerError> {
    let session = transport.connect(broker).await?;
    let dispatcher = processor.dispatcher();
    let declared = session
        .declare(&[dispatcher.requests().clone(), dispatcher.responses().clone()])
        .await;

    if let Err(e) = declared {
        let _ = session.close().await;
        return Err(e.into());
    }
    Ok(session)
}
