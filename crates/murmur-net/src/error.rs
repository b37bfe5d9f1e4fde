use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("Invalid transport configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::SendFailed(e.to_string())
    }
}
