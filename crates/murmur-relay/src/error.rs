use std::time::Duration;

use thiserror::Error;

use murmur_net::TransportError;

/// Reasons a client connection ends early.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No hello within {0:?}")]
    HelloTimeout(Duration),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Relay is full ({0} clients)")]
    Full(usize),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl RelayError {
    /// Text sent to the client in a final `Error` frame, if any.
    pub fn client_reason(&self) -> Option<String> {
        match self {
            RelayError::HelloTimeout(_) | RelayError::Handshake(_) | RelayError::Full(_) => {
                Some(self.to_string())
            }
            RelayError::Transport(_) => None,
        }
    }
}
