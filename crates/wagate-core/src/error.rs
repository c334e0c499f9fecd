use thiserror::Error;

/// Top-level error type for wagate.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No active session is registered under this id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// An outbound message spec is missing fields required by its type.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The existence pre-check reported that the destination has no account.
    #[error("recipient unverified: {0}")]
    RecipientUnverified(String),

    /// Error reported by the protocol library or socket.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Persistence error.
    #[error("store error: {0}")]
    Store(String),

    /// Media fetch or storage error.
    #[error("media error: {0}")]
    Media(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
