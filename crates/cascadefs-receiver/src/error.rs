//! Error types for the cascadefs-receiver crate

/// Errors that terminate the reactor loop
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    /// An unknown command id arrived on the request stream
    #[error("unknown command id {0}")]
    UnknownCommand(i32),

    /// A request body could not be parsed
    #[error("malformed request body: {0}")]
    MalformedRequest(String),

    /// Reading or writing a frame failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
