use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the standard request pool (exchange and queue).
pub const TASK_REQUESTS_POOL: &str = "bashtasks:pool:requests";

/// Name of the standard response pool (exchange and queue).
pub const TASK_RESPONSES_POOL: &str = "bashtasks:pool:responses";

/// Logical destination mapped onto a broker exchange/queue pair.
///
/// Publishing goes to `exchange`, consuming reads from `queue`; the transport
/// binds the two when the destination is declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    name: String,
    exchange: String,
    queue: String,
}

impl Destination {
    pub fn new(name: impl Into<String>, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Destination {
            name: name.into(),
            exchange: exchange.into(),
            queue: queue.into(),
        }
    }

    /// Destination whose exchange and queue share `name`
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Destination::new(name.clone(), name.clone(), name)
    }

    pub fn requests() -> Self {
        Destination::named(TASK_REQUESTS_POOL)
    }

    pub fn responses() -> Self {
        Destination::named(TASK_RESPONSES_POOL)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

impl Default for Destination {
    fn default() -> Self {
        Destination::requests()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_pools() {
        let requests = Destination::requests();
        assert_eq!(requests.exchange(), TASK_REQUESTS_POOL);
        assert_eq!(requests.queue(), TASK_REQUESTS_POOL);
        assert_ne!(requests, Destination::responses());
        assert_eq!(Destination::default(), requests);
    }

    #[test]
    fn test_named_destination() {
        let dest = Destination::named("gpu-jobs");
        assert_eq!(dest.name(), "gpu-jobs");
        assert_eq!(dest.exchange(), "gpu-jobs");
        assert_eq!(dest.queue(), "gpu-jobs");
        assert_eq!(dest.to_string(), "gpu-jobs");
    }
}
