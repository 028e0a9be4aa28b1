use crate::WorkerError;
use bashtasks_core::{Destination, TASK_REQUESTS_POOL};
use bashtasks_transport::BrokerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    /// Number of concurrent worker loops
    pub workers: usize,
    /// Tasks each worker runs before stopping the pool; `None` is unbounded
    pub tasks: Option<u64>,
    /// Retry budget for requests without their own `max_retries`
    pub max_retries: u32,
    /// Trace every message, not only unexpected return codes
    pub verbose: bool,
    pub ok_returncodes: Vec<i32>,
    /// Request destination to consume from and requeue to
    pub queue: String,
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            broker: BrokerConfig::default(),
            workers: 1,
            tasks: None,
            max_retries: 0,
            verbose: false,
            ok_returncodes: vec![0],
            queue: TASK_REQUESTS_POOL.to_string(),
            graceful_shutdown_timeout_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.workers == 0 {
            return Err(WorkerError::Config("workers must be at least 1".to_string()));
        }
        if self.tasks == Some(0) {
            return Err(WorkerError::Config(
                "tasks must be at least 1 (omit it for no limit)".to_string(),
            ));
        }
        if self.queue.is_empty() {
            return Err(WorkerError::Config("queue name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn request_destination(&self) -> Destination {
        Destination::named(self.queue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.tasks, None);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.ok_returncodes, vec![0]);
        assert_eq!(config.request_destination(), Destination::requests());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "broker:\n  host: rabbit.internal\n  username: bt\nworkers: 4\ntasks: 10\nmax_retries: 2\nok_returncodes: [0, 1]\nverbose: true"
        )
        .unwrap();

        let config = WorkerConfig::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.broker.host, "rabbit.internal");
        assert_eq!(config.broker.username, "bt");
        // Unset broker fields keep their defaults
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.workers, 4);
        assert_eq!(config.tasks, Some(10));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.ok_returncodes, vec![0, 1]);
        assert!(config.verbose);
        assert_eq!(config.queue, TASK_REQUESTS_POOL);
    }

    #[test]
    fn test_missing_file() {
        assert!(WorkerConfig::from_file("/nonexistent/bashtasks.yaml").is_err());
    }

    #[test]
    fn test_validate() {
        let config = WorkerConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(WorkerError::Config(_))));

        let config = WorkerConfig {
            tasks: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerConfig {
            tasks: Some(1),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
