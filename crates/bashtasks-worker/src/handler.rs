use crate::ExecutionError;
use async_trait::async_trait;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(returncode: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        CommandOutput {
            returncode,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Runs the command vector of a task.
///
/// [`CommandExecutor`](crate::CommandExecutor) spawns real processes; other
/// implementations can route commands somewhere else entirely. An `Err`
/// means the command could not be run at all and becomes an internal-error
/// response.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, command: &[String]) -> Result<CommandOutput, ExecutionError>;
}

/// Handler backed by a synchronous closure
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&[String]) -> Result<CommandOutput, ExecutionError> + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&[String]) -> Result<CommandOutput, ExecutionError> + Send + Sync,
{
    async fn run(&self, command: &[String]) -> Result<CommandOutput, ExecutionError> {
        (self.f)(command)
    }
}
