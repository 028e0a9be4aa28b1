//! Diagnostic dumps of task messages.

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

/// Whether an attempt with `returncode` gets its messages traced.
///
/// Only affects logging; retry classification never looks at
/// `ok_returncodes`.
pub fn should_trace(verbose: bool, ok_returncodes: &[i32], returncode: i32) -> bool {
    verbose || !ok_returncodes.contains(&returncode)
}

/// Log every top-level field of `message`, one line each.
///
/// Returns `false` if the message could not be rendered; the failure is
/// logged and processing carries on.
pub fn trace_message<T: Serialize>(label: &str, message: &T) -> bool {
    let value = match serde_json::to_value(message) {
        Ok(value) => value,
        Err(e) => {
            error!(label, error = %e, "Failed to render message for tracing");
            return false;
        }
    };

    info!("------------- {} -------------", label);
    match value {
        Value::Object(fields) => {
            for (key, value) in &fields {
                match value {
                    Value::String(text) => info!("\t{}:-> {}", key, text),
                    other => info!("\t{}:-> {}", key, other),
                }
            }
        }
        other => info!("\t{}", other),
    }
    info!("------------- end {} -------------", label);

    true
}
