use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Message size exceeds maximum allowed size of {max} bytes (got {actual})")]
    MessageTooLarge { max: usize, actual: usize },

    #[error("Malformed message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Command must contain at least a program name")]
    EmptyCommand,
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;
