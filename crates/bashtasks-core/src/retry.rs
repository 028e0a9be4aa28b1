//! Retry classification for executed tasks.
//!
//! A claimed message moves `RECEIVED → EXECUTED → {REQUEUE, FINALIZE}`. The
//! first two states live in the worker loop; this module owns the last step:
//! given the response of an attempt, decide whether the task goes back to the
//! request pool or is delivered to the response pool.

use crate::{CorrelationId, Destination, Result, TaskRequest, TaskResponse};
use serde::{Deserialize, Serialize};

/// Worker-wide retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Budget applied to requests that do not carry their own `max_retries`
    pub default_max_retries: u32,
}

/// What to publish after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run again: the original request with `retries` bumped by one
    Requeue(TaskRequest),
    /// Deliver the response; the task is done
    Finalize(TaskResponse),
}

impl RetryPolicy {
    pub fn new(default_max_retries: u32) -> Self {
        RetryPolicy { default_max_retries }
    }

    pub fn effective_max_retries(&self, request: &TaskRequest) -> u32 {
        request.max_retries.unwrap_or(self.default_max_retries)
    }

    /// Failed, not excluded by `non_retriable`, and budget left.
    ///
    /// The internal-error return code is treated like any other failure.
    pub fn should_retry(&self, response: &TaskResponse) -> bool {
        let request = &response.request;

        let is_error = response.returncode != 0;
        let is_retriable = !request.is_non_retriable(response.returncode);
        let retries_pending = request.retries < self.effective_max_retries(request);

        is_error && is_retriable && retries_pending
    }

    pub fn decide(&self, response: TaskResponse) -> Decision {
        if self.should_retry(&response) {
            let mut request = response.into_request();
            request.retries += 1;
            Decision::Requeue(request)
        } else {
            Decision::Finalize(response)
        }
    }
}

impl Decision {
    pub fn is_requeue(&self) -> bool {
        matches!(self, Decision::Requeue(_))
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Decision::Requeue(request) => &request.correlation_id,
            Decision::Finalize(response) => response.correlation_id(),
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            Decision::Requeue(request) => request.retries,
            Decision::Finalize(response) => response.retries(),
        }
    }

    /// Pick the target among the worker's request and response destinations
    pub fn destination<'a>(&self, requests: &'a Destination, responses: &'a Destination) -> &'a Destination {
        match self {
            Decision::Requeue(_) => requests,
            Decision::Finalize(_) => responses,
        }
    }

    /// Wire payload of the outgoing message
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Decision::Requeue(request) => request.to_bytes(),
            Decision::Finalize(response) => response.to_bytes(),
        }
    }
}
