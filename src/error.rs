//! Error taxonomy for the voice session and its auth plumbing.
//!
//! Transport and protocol errors are reported to the UI side as events; the
//! client never retries on its own.

use thiserror::Error;

/// Transport-level failures while opening or running the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Invalid channel URL: {0}")]
    InvalidUrl(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// `disconnect` was called while the handshake was still in flight.
    #[error("Connection aborted by disconnect")]
    Aborted,
}

impl From<url::ParseError> for ConnectionError {
    fn from(e: url::ParseError) -> Self {
        ConnectionError::InvalidUrl(e.to_string())
    }
}

/// Malformed or unexpected server messages. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed server message: {0}")]
    MalformedMessage(String),

    #[error("Invalid base64 audio payload: {0}")]
    InvalidAudio(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::MalformedMessage(e.to_string())
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(e: base64::DecodeError) -> Self {
        ProtocolError::InvalidAudio(e.to_string())
    }
}

/// Credential problems. `Missing` and `Expired` send the user back to login.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("No access token available")]
    Missing,

    #[error("Access token expired")]
    Expired,

    #[error("Malformed access token: {0}")]
    MalformedToken(String),

    #[error("Authentication rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Auth request failed: {0}")]
    Http(String),
}

impl AuthError {
    /// Whether the upstream should run its logout flow.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::Missing | AuthError::Expired | AuthError::Rejected { status: 401, .. }
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Http(e.to_string())
    }
}
