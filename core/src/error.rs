//! Error types for the chat core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Addressing asked for a == b, or one of the ids is empty
    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    /// Identity contains the conversation id separator
    #[error("Unsafe identifier: {0}")]
    UnsafeIdentifier(String),

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
