use bashtasks_core::TaskResponse;
use comfy_table::{presets::UTF8_FULL, Table};

/// Milliseconds from request creation to `now`, and spent in the command
pub fn timings(response: &TaskResponse, now: i64) -> (i64, i64) {
    (now - response.request.request_ts, response.command_millis())
}

pub fn render_table(response: &TaskResponse, now: i64) -> Table {
    let (total, command) = timings(response, now);

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Return code", &response.returncode.to_string()]);
    table.add_row(vec!["Command", &response.request.command.join(" ")]);
    table.add_row(vec!["Executor", &response.executor_name]);
    table.add_row(vec!["Retries", &response.retries().to_string()]);
    if !response.is_success() {
        table.add_row(vec!["Stderr", &response.stderr]);
    }
    table.add_row(vec!["Stdout", &response.stdout]);
    table.add_row(vec!["Total time", &format!("{}ms", total)]);
    table.add_row(vec!["Command time", &format!("{}ms", command)]);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use bashtasks_core::{Execution, TaskRequest};

    fn response(returncode: i32) -> TaskResponse {
        let mut request = TaskRequest::builder(["ls", "-l", "/tmp"]).build().unwrap();
        request.request_ts = 1_000;
        request.retries = 2;
        TaskResponse::new(
            request,
            "host:42:worker_th_0",
            Execution {
                pre_command_ts: 1_100,
                post_command_ts: 1_350,
                returncode,
                stdout: "listing".to_string(),
                stderr: "warning: odd".to_string(),
            },
        )
    }

    #[test]
    fn test_timings() {
        assert_eq!(timings(&response(0), 2_000), (1_000, 250));
    }

    #[test]
    fn test_success_hides_stderr() {
        let rendered = render_table(&response(0), 2_000).to_string();
        assert!(rendered.contains("ls -l /tmp"));
        assert!(rendered.contains("host:42:worker_th_0"));
        assert!(rendered.contains("listing"));
        assert!(rendered.contains("250ms"));
        assert!(!rendered.contains("warning: odd"));
    }

    #[test]
    fn test_failure_shows_stderr() {
        let rendered = render_table(&response(2), 2_000).to_string();
        assert!(rendered.contains("warning: odd"));
        assert!(rendered.contains("Retries"));
    }
}
