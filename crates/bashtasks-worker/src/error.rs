use bashtasks_core::EnvelopeError;
use bashtasks_transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// The command could not be run; no exit code exists.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to collect output of {program:?}: {source}")]
    Communicate {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Handler(String),
}
