use crate::{EnvelopeError, Result, MAX_MESSAGE_SIZE};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Return code reported when the command could not be run at all
/// (spawn failure, missing executable, broken pipe to the child).
pub const INTERNAL_ERROR_RETURNCODE: i32 = -3791;

/// `stdout` carried by responses with [`INTERNAL_ERROR_RETURNCODE`].
pub const INTERNAL_ERROR_STDOUT: &str = "Exception trying to execute command.";

/// Field names owned by [`TaskResponse`]. They are never carried in the
/// request's extra fields, otherwise a response would serialize them twice.
const RESPONSE_FIELDS: [&str; 6] = [
    "executor_name",
    "pre_command_ts",
    "post_command_ts",
    "returncode",
    "stdout",
    "stderr",
];

/// Milliseconds since the Unix epoch.
pub fn current_time_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Producer-assigned task identifier.
///
/// Older producers send integers, newer ones send strings; both are accepted
/// and written back in the form they arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Numeric(u64),
    Text(String),
}

impl CorrelationId {
    /// New random identifier.
    pub fn generate() -> Self {
        CorrelationId::Text(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Numeric(id) => write!(f, "{}", id),
            CorrelationId::Text(id) => f.write_str(id),
        }
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        CorrelationId::Numeric(id)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        CorrelationId::Text(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        CorrelationId::Text(id.to_string())
    }
}

/// A request to run one command on some worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Identifier matching the eventual response; never changes across retries
    pub correlation_id: CorrelationId,

    /// Program followed by its arguments
    pub command: Vec<String>,

    /// Creation time, epoch milliseconds
    #[serde(default)]
    pub request_ts: i64,

    /// Retry cycles already consumed
    #[serde(default)]
    pub retries: u32,

    /// Per-task retry budget; `None` defers to the worker default
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Exit codes that finalize the task even with budget left
    #[serde(default)]
    pub non_retriable: BTreeSet<i32>,

    /// Carried into the response as is; responses are always published to
    /// the standard response destination regardless of this value
    #[serde(default)]
    pub reply_to: Option<String>,

    /// Fields this version does not know about, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskRequest {
    /// Create a request builder for `command`
    pub fn builder<I, S>(command: I) -> TaskRequestBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TaskRequestBuilder::new(command)
    }

    /// Serialize to the JSON wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Deserialize from the JSON wire format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_size(bytes)?;
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }

    /// Is `returncode` listed as non-retriable for this task?
    pub fn is_non_retriable(&self, returncode: i32) -> bool {
        self.non_retriable.contains(&returncode)
    }

    fn strip_response_fields(&mut self) {
        for field in RESPONSE_FIELDS {
            self.extra.remove(field);
        }
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub pre_command_ts: i64,
    pub post_command_ts: i64,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Execution {
    /// Attempt that never got to run the command.
    pub fn internal_error(pre_command_ts: i64, post_command_ts: i64, description: String) -> Self {
        Execution {
            pre_command_ts,
            post_command_ts,
            returncode: INTERNAL_ERROR_RETURNCODE,
            stdout: INTERNAL_ERROR_STDOUT.to_string(),
            stderr: description,
        }
    }
}

/// The request as received plus the result of running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    #[serde(flatten)]
    pub request: TaskRequest,

    /// `<host>:<pid>:<worker slot>` of the executing worker
    pub executor_name: String,

    pub pre_command_ts: i64,
    pub post_command_ts: i64,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TaskResponse {
    pub fn new(mut request: TaskRequest, executor_name: impl Into<String>, execution: Execution) -> Self {
        request.strip_response_fields();

        TaskResponse {
            request,
            executor_name: executor_name.into(),
            pre_command_ts: execution.pre_command_ts,
            post_command_ts: execution.post_command_ts,
            returncode: execution.returncode,
            stdout: execution.stdout,
            stderr: execution.stderr,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.request.correlation_id
    }

    pub fn retries(&self) -> u32 {
        self.request.retries
    }

    pub fn is_success(&self) -> bool {
        self.returncode == 0
    }

    pub fn is_internal_error(&self) -> bool {
        self.returncode == INTERNAL_ERROR_RETURNCODE
    }

    /// Time spent running the command, in milliseconds
    pub fn command_millis(&self) -> i64 {
        self.post_command_ts - self.pre_command_ts
    }

    /// Drop the execution fields and recover the request
    pub fn into_request(self) -> TaskRequest {
        self.request
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_size(bytes)?;
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }
}

fn check_size(bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(EnvelopeError::MessageTooLarge {
            max: MAX_MESSAGE_SIZE,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Builder for producer-side requests
pub struct TaskRequestBuilder {
    command: Vec<String>,
    correlation_id: Option<CorrelationId>,
    max_retries: Option<u32>,
    non_retriable: BTreeSet<i32>,
    reply_to: Option<String>,
    extra: Map<String, Value>,
}

impl TaskRequestBuilder {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TaskRequestBuilder {
            command: command.into_iter().map(Into::into).collect(),
            correlation_id: None,
            max_retries: None,
            non_retriable: BTreeSet::new(),
            reply_to: None,
            extra: Map::new(),
        }
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn non_retriable<I: IntoIterator<Item = i32>>(mut self, codes: I) -> Self {
        self.non_retriable.extend(codes);
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Attach an application-defined field
    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Result<TaskRequest> {
        if self.command.is_empty() {
            return Err(EnvelopeError::EmptyCommand);
        }

        let mut request = TaskRequest {
            correlation_id: self.correlation_id.unwrap_or_else(CorrelationId::generate),
            command: self.command,
            request_ts: current_time_millis(),
            retries: 0,
            max_retries: self.max_retries,
            non_retriable: self.non_retriable,
            reply_to: self.reply_to,
            extra: self.extra,
        };
        request.strip_response_fields();
        Ok(request)
    }
}
