//! Error types for parley-core

use thiserror::Error;

/// Result type alias using parley-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the backend client layer
    #[error(transparent)]
    Api(#[from] parley_api::Error),

    /// No conversation with this id is held by the store
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// No message with this id is held by the store
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// The message was already finalized
    #[error("Message is not streaming: {0}")]
    NotStreaming(String),

    /// A turn is already in flight
    #[error("A response is already streaming")]
    TurnInProgress,

    /// Refused to send a blank message
    #[error("Message is empty")]
    EmptyMessage,

    /// The conversation can not be registered with the backend
    #[error("Conversation can not be published: {0}")]
    NotPublishable(String),

    /// Snapshot file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error is a rejected send rather than a failure
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::TurnInProgress | Error::EmptyMessage)
    }
}
