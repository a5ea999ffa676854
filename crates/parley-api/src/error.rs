//! Error types for parley-api

use thiserror::Error;

/// Result type alias using parley-api Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the chat backend
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Server-sent events transport error
    #[error("SSE error: {0}")]
    Sse(String),

    /// A stream payload could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport closed before a terminal chunk arrived
    #[error("Stream ended unexpectedly")]
    StreamEnded,

    /// Stream was aborted by the caller
    #[error("Request aborted")]
    Aborted,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an API error from a status code and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Whether this error came from the network rather than from the backend's answer
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Http(_) | Error::Sse(_) | Error::StreamEnded => true,
            Error::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the backend reported the resource as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api { status: 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_variants() {
        assert!(Error::Sse("connection reset".into()).is_transport());
        assert!(Error::StreamEnded.is_transport());
        assert!(Error::api(502, "bad gateway").is_transport());
    }

    #[test]
    fn test_not_transport() {
        assert!(!Error::api(404, "Conversation not found").is_transport());
        assert!(!Error::Protocol("bad chunk".into()).is_transport());
        assert!(!Error::Aborted.is_transport());
    }

    #[test]
    fn test_not_found() {
        assert!(Error::api(404, "missing").is_not_found());
        assert!(!Error::api(500, "missing").is_not_found());
    }

    #[test]
    fn test_api_display() {
        let e = Error::api(422, "message is required");
        assert_eq!(e.to_string(), "API error (422): message is required");
    }
}
