//! Error taxonomy surfaced to callers of the liveness layer.

use crate::descriptor::DescriptorError;
use crate::envelope::EnvelopeError;
use crate::identity::IdentityError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LivenessError {
    /// The link could not be established within the retry budget
    #[error("Connection failed to {endpoint} after {attempts} attempt(s)")]
    Connection { endpoint: String, attempts: u32 },

    /// No reply arrived within the retry budget
    #[error("No reply from {endpoint} after {attempts} attempt(s)")]
    Timeout { endpoint: String, attempts: u32 },

    /// The socket was unusable and has been recreated; the operation may be retried
    #[error("Socket was invalid and has been reinitialized: {0}")]
    SocketInvalid(#[source] TransportError),

    #[error(transparent)]
    Malformed(#[from] EnvelopeError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl LivenessError {
    /// Whether retrying the same logical operation is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LivenessError::Connection { .. }
                | LivenessError::Timeout { .. }
                | LivenessError::SocketInvalid(_)
        )
    }
}

impl From<TransportError> for LivenessError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidEndpoint(endpoint) => {
                LivenessError::Config(format!("invalid endpoint '{}'", endpoint))
            }
            other => LivenessError::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, LivenessError>;
