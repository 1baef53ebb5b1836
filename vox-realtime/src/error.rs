//! Error types for live sessions.

use thiserror::Error;
use vox_audio::AudioError;

/// Result type for realtime operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Errors that can occur during realtime operations.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// WebSocket connection error.
    #[error("WebSocket connection error: {0}")]
    ConnectionError(String),

    /// The service rejected our credentials.
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Malformed or unexpected message.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Session not connected.
    #[error("Session not connected")]
    NotConnected,

    /// Operation not valid in the current connection state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Failed to obtain a credential.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Audio pipeline failure.
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl RealtimeError {
    /// Create a new connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::AuthError(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a new invalid-state error.
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether re-authenticating (rather than plain retrying) is the right response.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::AuthError(_) => true,
            Self::Credential(e) => e.is_auth(),
            _ => false,
        }
    }
}

/// Errors from the credential endpoint.
///
/// `Clone` so that one in-flight refresh can hand the same outcome to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    /// The request never produced a response.
    #[error("credential request failed: {0}")]
    Request(String),

    /// The endpoint answered with a non-success status.
    #[error("credential endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The response body was not a usable credential.
    #[error("invalid credential response: {0}")]
    InvalidResponse(String),
}

impl CredentialError {
    /// Whether the endpoint refused our own bearer token.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for CredentialError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}
