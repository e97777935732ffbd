//! Error types for the messaging core.
//!
//! The first four variants are the failure classes the rest of the
//! application reacts to: connection failures only ever show up as an offline
//! indicator, resolution failures are rendered inline, send failures become a
//! toast and poll failures are logged and retried on the next tick. Nothing in
//! this crate is fatal to the host.

use thiserror::Error;

/// Errors returned by the messaging core.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The live socket failed or closed. Recovered by reconnecting.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A conversation could not be resolved or created.
    #[error("Could not open conversation: {0}")]
    Resolution(String),

    /// Persisting an outbound message failed.
    #[error("Message not sent: {0}")]
    Send(String),

    /// A fallback re-fetch failed.
    #[error("Poll failed: {0}")]
    Poll(String),

    /// The live channel is not open, so the frame was not sent.
    #[error("Live channel is not connected")]
    NotConnected,

    /// The token provider could not supply a bearer token.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The REST backend answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// `detail` from the response body, or the raw body.
        message: String,
    },

    /// HTTP request failed before a response was read.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A base URL could not be parsed or joined.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Outbound message content was rejected before sending.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The owning thread session has been torn down.
    #[error("Thread session is closed")]
    SessionClosed,

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether the failure is expected to clear up without user action.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Connection(_) | ChatError::Poll(_) | ChatError::NotConnected => true,
            ChatError::Http(err) => err.is_timeout() || err.is_connect(),
            ChatError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<config::ConfigError> for ChatError {
    fn from(err: config::ConfigError) -> Self {
        ChatError::Config(err.to_string())
    }
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ChatError::Connection("reset".into()).is_transient());
        assert!(ChatError::NotConnected.is_transient());
        assert!(
            ChatError::Api {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !ChatError::Api {
                status: 403,
                message: "forbidden".into()
            }
            .is_transient()
        );
        assert!(!ChatError::Resolution("not found".into()).is_transient());
    }

    #[test]
    fn api_error_display_includes_status() {
        let err = ChatError::Api {
            status: 404,
            message: "Incident not found".into(),
        };
        assert_eq!(err.to_string(), "API error (404): Incident not found");
    }
}
