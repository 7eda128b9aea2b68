//! Error types.

/// Error type for mailbridge.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Mailbridge config is invalid: {0}")]
    Config(#[from] serini::Error),
    #[error("Mailbridge config is missing `{0}`")]
    MissingSetting(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to parse message: {0}")]
    MalformedMessage(#[from] mailparse::MailParseError),
    #[error("Message has no header fields")]
    EmptyMessage,
    #[error("Malformed storage notification: {0}")]
    MalformedEvent(#[from] serde_json::Error),
    #[error("SMTP transport setup failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("Queue request failed: {0}")]
    Queue(String),
    #[error("Object store request failed: {0}")]
    Store(String),
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}
