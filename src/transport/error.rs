//! Transport error types

use thiserror::Error;

/// Transport error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn open(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Open, message)
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Send, message)
    }

    pub fn request(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Request, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Auth, message)
    }

    pub fn malformed_push(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::MalformedPush, message)
    }

    pub fn is_auth(&self) -> bool {
        self.kind == TransportErrorKind::Auth
    }
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Channel failed to establish - triggers the reconnect policy
    Open,
    /// Channel exists but the send failed - caller falls back to a request
    Send,
    /// Synchronous call failed or was rejected by the server
    Request,
    /// Credential rejected (401) - fatal, not retried
    Auth,
    /// Push payload missing required fields - dropped
    MalformedPush,
}

impl TransportErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Open | Self::Send | Self::Request)
    }
}
