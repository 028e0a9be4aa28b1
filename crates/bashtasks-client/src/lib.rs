//! Producer side of bashtasks: publish command requests and wait for their
//! responses.

mod async_client;
mod sync_client;

pub use async_client::BashTasksClient;
pub use sync_client::BashTasksSyncClient;

use bashtasks_core::{CorrelationId, EnvelopeError};
use bashtasks_transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Timed out waiting for the response to {0}")]
    Timeout(CorrelationId),

    #[error("Response stream ended before the response to {0} arrived")]
    StreamEnded(CorrelationId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
