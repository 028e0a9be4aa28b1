mod envelope;
mod destination;
mod retry;
mod error;

pub use envelope::{
    current_time_millis, CorrelationId, Execution, TaskRequest, TaskRequestBuilder, TaskResponse,
    INTERNAL_ERROR_RETURNCODE, INTERNAL_ERROR_STDOUT,
};
pub use destination::{Destination, TASK_REQUESTS_POOL, TASK_RESPONSES_POOL};
pub use retry::{Decision, RetryPolicy};
pub use error::{EnvelopeError, Result};

pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB
