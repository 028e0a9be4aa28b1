pub mod worker;
pub mod pool;
pub mod shutdown;
pub mod handler;
pub mod executor;
pub mod dispatcher;
pub mod trace;
pub mod config;
mod error;

pub use worker::{executor_name, worker_name, Outcome, TaskBudget, TaskProcessor, Worker, WorkerState};
pub use pool::WorkerPool;
pub use shutdown::{install_signal_handler, ShutdownContext, ShutdownReason};
pub use handler::{handler_fn, CommandHandler, CommandOutput, FnHandler};
pub use executor::CommandExecutor;
pub use dispatcher::ResponseDispatcher;
pub use config::WorkerConfig;
pub use error::{ExecutionError, WorkerError};
