//! Connection error types.

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Result type for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Errors raised while driving a connection.
///
/// Every error is handled locally by the connection: it either moves the
/// connection to `ConnectFailed` (retryable) or `Stopped` (terminal). The
/// error value is what the owner of a write observes through its receipt.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The remote node refused the connection or could not be reached.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The connect timer fired before the socket was established.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Socket error (or operation deadline) while sending a buffer.
    #[error("Write failed: {0}")]
    Write(String),

    /// Malformed, unexpected or missing response frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The keep-alive probe went unanswered.
    #[error("Connection idle for {0:?} and keep-alive probe unanswered")]
    IdleTimeout(Duration),

    /// The operation was superseded by an explicit close.
    #[error("Operation cancelled: connection closed")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error outside of the connection state machine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`ConnectionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    /// Refused or timed-out connect.
    Connect,
    /// Socket error during send.
    Write,
    /// Bad or missing response frame.
    Protocol,
    /// Keep-alive probe unanswered.
    IdleTimeout,
    /// Superseded by close.
    Cancelled,
    /// Configuration problem.
    Config,
}

impl ConnectionError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) | Self::ConnectTimeout(_) => ErrorKind::Connect,
            Self::Write(_) | Self::Io(_) => ErrorKind::Write,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::IdleTimeout(_) => ErrorKind::IdleTimeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Check if the payload that hit this error may be redelivered.
    ///
    /// Only configuration errors are permanent; everything else is a property
    /// of this particular connection and another connection may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }

    /// Check if this is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_) | Self::IdleTimeout(_))
    }
}

/// A payload that could not be delivered, handed back to its submitter.
#[derive(Debug, Error)]
#[error("Payload of {} bytes undelivered: {error}", .payload.len())]
pub struct Undelivered {
    /// The original, untouched payload.
    pub payload: Bytes,
    /// Why delivery failed.
    #[source]
    pub error: ConnectionError,
}

impl Undelivered {
    /// Create a new undelivered record.
    pub fn new(payload: Bytes, error: ConnectionError) -> Self {
        Self { payload, error }
    }

    /// Error classification shortcut.
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// Take the payload back for redelivery.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
