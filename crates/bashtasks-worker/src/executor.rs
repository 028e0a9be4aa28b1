use crate::handler::{CommandHandler, CommandOutput};
use crate::ExecutionError;
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Exit status reported when the process ended without a code or signal
const UNKNOWN_EXIT: i32 = -1;

/// Runs task commands as child processes, without a shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        CommandExecutor
    }

    /// Spawn `command[0]` with the remaining elements as arguments and wait
    /// for it, capturing stdout and stderr in full.
    ///
    /// A process killed by signal `N` reports `-N`. Output is decoded as
    /// UTF-8, replacing invalid sequences.
    pub async fn execute(&self, command: &[String]) -> Result<CommandOutput, ExecutionError> {
        let (program, args) = command.split_first().ok_or(ExecutionError::EmptyCommand)?;

        debug!(program = %program, args = ?args, "Spawning command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ExecutionError::Communicate {
                program: program.clone(),
                source,
            })?;

        let returncode = exit_code(output.status);
        debug!(program = %program, returncode, "Command finished");

        Ok(CommandOutput {
            returncode,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl CommandHandler for CommandExecutor {
    async fn run(&self, command: &[String]) -> Result<CommandOutput, ExecutionError> {
        self.execute(command).await
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    UNKNOWN_EXIT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_echo() {
        let output = CommandExecutor::new().execute(&cmd(&["echo", "hello world"])).await.unwrap();

        assert_eq!(output.returncode, 0);
        assert_eq!(output.stdout, "hello world\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_expanded() {
        let output = CommandExecutor::new().execute(&cmd(&["echo", "$HOME", "*"])).await.unwrap();
        assert_eq!(output.stdout, "$HOME *\n");
    }

    #[tokio::test]
    async fn test_exit_code() {
        let output = CommandExecutor::new().execute(&cmd(&["sh", "-c", "exit 42"])).await.unwrap();
        assert_eq!(output.returncode, 42);
    }

    #[tokio::test]
    async fn test_stderr_captured() {
        let output = CommandExecutor::new()
            .execute(&cmd(&["sh", "-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();

        assert_eq!(output.returncode, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_stdin_is_closed() {
        // cat would block forever on an inherited terminal
        let output = CommandExecutor::new().execute(&cmd(&["cat"])).await.unwrap();
        assert_eq!(output.returncode, 0);
        assert!(output.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_large_output() {
        let output = CommandExecutor::new().execute(&cmd(&["seq", "1", "20000"])).await.unwrap();
        assert_eq!(output.stdout.lines().count(), 20000);
        assert_eq!(output.stdout.lines().last(), Some("20000"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_killed_by_signal_reports_negative_code() {
        let output = CommandExecutor::new()
            .execute(&cmd(&["sh", "-c", "kill -9 $$"]))
            .await
            .unwrap();
        assert_eq!(output.returncode, -9);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = CommandExecutor::new()
            .execute(&cmd(&["/nonexistent/bashtasks-binary"]))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/bashtasks-binary"));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let err = CommandExecutor::new().execute(&[]).await.unwrap_err();
        assert!(matches!(err, ExecutionError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let output = CommandExecutor::new()
            .execute(&cmd(&["printf", "a\\377b"]))
            .await
            .unwrap();
        assert_eq!(output.stdout, "a\u{FFFD}b");
    }
}
