/// Error types for the conversation engine
use crate::types::{LocalId, UserId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("History load for {counterpart} failed: {reason}")]
    HistoryLoad { counterpart: UserId, reason: String },

    #[error("Presence poll failed: {0}")]
    PresencePoll(String),

    #[error("Send of {local_id} failed: {reason}")]
    SendFailed { local_id: LocalId, reason: String },

    #[error("Invalid auth token: {0}")]
    InvalidToken(String),

    #[error("Message content is empty")]
    EmptyMessage,

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Transport failures are recovered by reconnecting, never surfaced as fatal.
    pub fn is_transport(&self) -> bool {
        matches!(self, ChatError::Transport(_) | ChatError::SendFailed { .. })
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
