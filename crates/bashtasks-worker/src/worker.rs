use crate::dispatcher::ResponseDispatcher;
use crate::handler::CommandHandler;
use crate::shutdown::{ShutdownContext, ShutdownReason};
use crate::trace::{should_trace, trace_message};
use crate::WorkerError;
use bashtasks_core::{current_time_millis, Execution, RetryPolicy, TaskRequest, TaskResponse};
use bashtasks_transport::{Delivery, Session, WORKER_PREFETCH};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Longest body prefix logged for an undecodable message
const BODY_PREVIEW_LEN: usize = 256;

/// Tasks a worker may still run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskBudget {
    Unbounded,
    Remaining(u64),
}

impl TaskBudget {
    pub fn from_limit(limit: Option<u64>) -> Self {
        match limit {
            Some(n) => TaskBudget::Remaining(n),
            None => TaskBudget::Unbounded,
        }
    }

    /// Count one finished task. Returns `true` once nothing is left.
    pub fn consume(&mut self) -> bool {
        match self {
            TaskBudget::Unbounded => false,
            TaskBudget::Remaining(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        match self {
            TaskBudget::Unbounded => None,
            TaskBudget::Remaining(n) => Some(*n),
        }
    }
}

pub fn worker_name(slot: usize) -> String {
    format!("worker_th_{}", slot)
}

/// `host:pid:worker_th_N`, stamped on every response of worker `slot`
pub fn executor_name(slot: usize) -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}:{}:{}", hostname, std::process::id(), worker_name(slot))
}

/// Per-worker state, built once when the worker starts.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub slot: usize,
    pub name: String,
    pub executor_name: String,
    pub budget: TaskBudget,
    pub processed: u64,
}

impl WorkerState {
    pub fn new(slot: usize, budget: TaskBudget) -> Self {
        WorkerState {
            slot,
            name: worker_name(slot),
            executor_name: executor_name(slot),
            budget,
            processed: 0,
        }
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Requeued,
    Finalized,
    /// Not a task; rejected to the dead-letter queue
    DeadLettered,
}

/// Everything needed to handle a delivery, shared by all workers of a pool.
pub struct TaskProcessor {
    handler: Arc<dyn CommandHandler>,
    policy: RetryPolicy,
    dispatcher: ResponseDispatcher,
    verbose: bool,
    ok_returncodes: Vec<i32>,
}

impl TaskProcessor {
    pub fn new(
        handler: Arc<dyn CommandHandler>,
        policy: RetryPolicy,
        dispatcher: ResponseDispatcher,
        verbose: bool,
        ok_returncodes: Vec<i32>,
    ) -> Self {
        TaskProcessor {
            handler,
            policy,
            dispatcher,
            verbose,
            ok_returncodes,
        }
    }

    pub fn dispatcher(&self) -> &ResponseDispatcher {
        &self.dispatcher
    }

    /// Decode, execute, classify and dispatch one delivery.
    pub async fn process(
        &self,
        state: &WorkerState,
        session: &dyn Session,
        delivery: Delivery,
    ) -> Result<Outcome, WorkerError> {
        let request = match TaskRequest::from_bytes(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    worker = %state.name,
                    tag = delivery.tag,
                    error = %e,
                    body = %body_preview(&delivery.body),
                    "Dead-lettering undecodable message"
                );
                session.reject(delivery.tag, false).await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        debug!(
            worker = %state.name,
            correlation_id = %request.correlation_id,
            retries = request.retries,
            redelivered = delivery.redelivered,
            command = ?request.command,
            ">>>> Received"
        );

        let response = self.execute(state, request).await;

        if should_trace(self.verbose, &self.ok_returncodes, response.returncode) {
            trace_message(
                &format!("Request msg: {}", response.correlation_id()),
                &response.request,
            );
            trace_message(
                &format!(
                    "Response msg: {} returncode: {}",
                    response.correlation_id(),
                    response.returncode
                ),
                &response,
            );
        }

        let returncode = response.returncode;
        let decision = self.policy.decide(response);
        let outcome = if decision.is_requeue() {
            info!(
                worker = %state.name,
                correlation_id = %decision.correlation_id(),
                returncode,
                retry = decision.retries(),
                "Command failed, requeueing"
            );
            Outcome::Requeued
        } else {
            Outcome::Finalized
        };

        self.dispatcher.dispatch(session, delivery.tag, &decision).await?;

        Ok(outcome)
    }

    async fn execute(&self, state: &WorkerState, request: TaskRequest) -> TaskResponse {
        let pre_command_ts = current_time_millis();
        let result = self.handler.run(&request.command).await;
        let post_command_ts = current_time_millis();

        let execution = match result {
            Ok(output) => Execution {
                pre_command_ts,
                post_command_ts,
                returncode: output.returncode,
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Err(e) => {
                error!(
                    worker = %state.name,
                    correlation_id = %request.correlation_id,
                    error = %e,
                    "Failed to execute command"
                );
                Execution::internal_error(pre_command_ts, post_command_ts, e.to_string())
            }
        };

        TaskResponse::new(request, state.executor_name.clone(), execution)
    }
}

fn body_preview(body: &[u8]) -> String {
    let end = body.len().min(BODY_PREVIEW_LEN);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

/// One consume loop on a private session.
pub struct Worker {
    state: WorkerState,
    session: Arc<dyn Session>,
    processor: Arc<TaskProcessor>,
    shutdown: Arc<ShutdownContext>,
}

impl Worker {
    pub fn new(
        state: WorkerState,
        session: Arc<dyn Session>,
        processor: Arc<TaskProcessor>,
        shutdown: Arc<ShutdownContext>,
    ) -> Self {
        Worker {
            state,
            session,
            processor,
            shutdown,
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Handle deliveries one at a time until shutdown, the end of the
    /// consumer stream, or a transport error.
    pub async fn run(mut self) -> Result<WorkerState, WorkerError> {
        let queue = self.processor.dispatcher().requests().clone();
        let mut deliveries = self.session.consume(&queue, WORKER_PREFETCH).await?;

        info!(
            worker = %self.state.name,
            executor = %self.state.executor_name,
            queue = %queue,
            tasks = ?self.state.budget.remaining(),
            "<< Ready"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(delivery) => delivery?,
                None => {
                    debug!(worker = %self.state.name, "Consumer stream ended");
                    break;
                }
            };

            let outcome = self
                .processor
                .process(&self.state, self.session.as_ref(), delivery)
                .await?;
            if outcome == Outcome::DeadLettered {
                continue;
            }

            self.state.processed += 1;
            let exhausted = self.state.budget.consume();
            debug!(
                worker = %self.state.name,
                processed = self.state.processed,
                pending = ?self.state.budget.remaining(),
                "<<<< Done"
            );

            if exhausted {
                info!(worker = %self.state.name, "==== No more tasks to execute");
                self.shutdown
                    .trigger(ShutdownReason::TaskBudgetExhausted {
                        slot: self.state.slot,
                    })
                    .await;
                break;
            }
        }

        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, CommandOutput};
    use crate::ExecutionError;
    use bashtasks_core::{Destination, TaskResponse, INTERNAL_ERROR_RETURNCODE, INTERNAL_ERROR_STDOUT};
    use bashtasks_transport::{Deliveries, MemoryBroker, MemorySession};

    fn processor(handler: Arc<dyn CommandHandler>, max_retries: u32) -> TaskProcessor {
        TaskProcessor::new(
            handler,
            RetryPolicy::new(max_retries),
            ResponseDispatcher::default(),
            false,
            vec![0],
        )
    }

    async fn session_with(
        broker: &MemoryBroker,
        bodies: &[Vec<u8>],
    ) -> (Arc<MemorySession>, Deliveries) {
        let session = broker.session();
        session
            .declare(&[Destination::requests(), Destination::responses()])
            .await
            .unwrap();
        for body in bodies {
            session.publish(&Destination::requests(), body, true).await.unwrap();
        }
        let deliveries = session.consume(&Destination::requests(), WORKER_PREFETCH).await.unwrap();
        (session, deliveries)
    }

    #[test]
    fn test_budget() {
        let mut budget = TaskBudget::from_limit(Some(2));
        assert!(!budget.consume());
        assert_eq!(budget.remaining(), Some(1));
        assert!(budget.consume());
        assert_eq!(budget.remaining(), Some(0));

        let mut unbounded = TaskBudget::from_limit(None);
        for _ in 0..100 {
            assert!(!unbounded.consume());
        }
        assert_eq!(unbounded.remaining(), None);
    }

    #[test]
    fn test_executor_name() {
        let name = executor_name(3);
        let parts: Vec<&str> = name.rsplitn(3, ':').collect();
        assert_eq!(parts[0], "worker_th_3");
        assert_eq!(parts[1], std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_process_success() {
        let broker = MemoryBroker::new();
        let request = TaskRequest::builder(["ls", "-l"]).correlation_id(5u64).build().unwrap();
        let (session, mut deliveries) = session_with(&broker, &[request.to_bytes().unwrap()]).await;

        let handler = Arc::new(handler_fn(|command: &[String]| {
            Ok(CommandOutput::new(0, format!("ran {}", command.join(" ")), ""))
        }));
        let state = WorkerState::new(0, TaskBudget::Unbounded);
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = processor(handler, 0)
            .process(&state, session.as_ref(), delivery)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Finalized);
        assert_eq!(session.unacked(), 0);
        let responses = broker.drain(Destination::responses().queue());
        let response = TaskResponse::from_bytes(&responses[0]).unwrap();
        assert_eq!(response.stdout, "ran ls -l");
        assert_eq!(response.executor_name, state.executor_name);
        assert!(response.pre_command_ts <= response.post_command_ts);
        assert!(response.pre_command_ts >= request.request_ts);
    }

    #[tokio::test]
    async fn test_process_handler_error_becomes_sentinel() {
        let broker = MemoryBroker::new();
        let request = TaskRequest::builder(["boom"]).build().unwrap();
        let (session, mut deliveries) = session_with(&broker, &[request.to_bytes().unwrap()]).await;

        let handler = Arc::new(handler_fn(|_: &[String]| {
            Err(ExecutionError::Handler("exploded".to_string()))
        }));
        let state = WorkerState::new(0, TaskBudget::Unbounded);
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = processor(handler, 0)
            .process(&state, session.as_ref(), delivery)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Finalized);
        let responses = broker.drain(Destination::responses().queue());
        let response = TaskResponse::from_bytes(&responses[0]).unwrap();
        assert_eq!(response.returncode, INTERNAL_ERROR_RETURNCODE);
        assert_eq!(response.stdout, INTERNAL_ERROR_STDOUT);
        assert_eq!(response.stderr, "exploded");
    }

    #[tokio::test]
    async fn test_process_dead_letters_garbage() {
        let broker = MemoryBroker::new();
        let (session, mut deliveries) = session_with(&broker, &[b"not json".to_vec()]).await;

        let handler = Arc::new(handler_fn(|_: &[String]| -> Result<CommandOutput, ExecutionError> {
            panic!("handler must not run for undecodable messages")
        }));
        let state = WorkerState::new(0, TaskBudget::Unbounded);
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = processor(handler, 0)
            .process(&state, session.as_ref(), delivery)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::DeadLettered);
        assert_eq!(session.unacked(), 0);
        assert_eq!(
            broker.dead_letters(Destination::requests().queue()),
            vec![b"not json".to_vec()]
        );
        assert_eq!(broker.queue_len(Destination::responses().queue()), 0);
    }

    #[tokio::test]
    async fn test_process_verbose_trace_keeps_going() {
        let broker = MemoryBroker::new();
        let request = TaskRequest::builder(["x"]).build().unwrap();
        let (session, mut deliveries) = session_with(&broker, &[request.to_bytes().unwrap()]).await;

        let handler = Arc::new(handler_fn(|_: &[String]| Ok(CommandOutput::new(7, "", "bad"))));
        let processor = TaskProcessor::new(
            handler,
            RetryPolicy::new(0),
            ResponseDispatcher::default(),
            true,
            vec![0],
        );
        let state = WorkerState::new(0, TaskBudget::Unbounded);
        let delivery = deliveries.next().await.unwrap().unwrap();

        let outcome = processor.process(&state, session.as_ref(), delivery).await.unwrap();
        assert_eq!(outcome, Outcome::Finalized);
        assert_eq!(broker.queue_len(Destination::responses().queue()), 1);
    }

    #[test]
    fn test_body_preview_is_bounded() {
        let body = vec![b'a'; BODY_PREVIEW_LEN * 4];
        assert_eq!(body_preview(&body).len(), BODY_PREVIEW_LEN);
        assert_eq!(body_preview(b"short"), "short");
    }
}
