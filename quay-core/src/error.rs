/// Quay Error Types
///
/// One error type for every layer of the client, from socket setup to the
/// message handler boundary.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::endpoint::Address;

/// Main error type for Quay operations
#[derive(Error, Debug)]
pub enum QuayError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid options supplied by the caller. Raised before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// TCP / Unix socket establishment failed
    #[error("Connect to {address} failed: {source}")]
    Connect {
        address: Address,
        #[source]
        source: io::Error,
    },

    /// Malformed frame, unexpected frame type or broker-reported fatal error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Declared frame length beyond the configured ceiling
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// No frame (heartbeats included) arrived within the watchdog window
    #[error("Heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    /// Authorization denied by the broker
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// The application message handler failed
    #[error("Handler fault: {0}")]
    HandlerFault(String),

    /// TLS negotiation or record processing failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Snappy / deflate stream corruption
    #[error("Compression error: {0}")]
    Compression(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// A message was finished or requeued twice
    #[error("Message {0} already responded")]
    AlreadyResponded(String),

    /// Internal channel closed (owner task gone)
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type alias for Quay operations
pub type Result<T> = std::result::Result<T, QuayError>;

impl QuayError {
    /// Create a configuration error with a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an authorization error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a compression error
    pub fn compression(msg: impl Into<String>) -> Self {
        Self::Compression(msg.into())
    }

    /// Check if the owner should schedule a reconnect after this error.
    ///
    /// Configuration and authorization failures need a change on the
    /// caller's side; retrying them only hammers the broker.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Configuration(_) | Self::Auth(_))
    }

    /// Check if this is a connection-level failure
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectionClosed
                | Self::HeartbeatTimeout(_)
                | Self::Io(_)
        )
    }
}

impl From<QuayError> for io::Error {
    fn from(err: QuayError) -> Self {
        match err {
            QuayError::Io(e) => e,
            QuayError::ConnectionClosed => io::Error::new(io::ErrorKind::NotConnected, err),
            QuayError::HeartbeatTimeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(QuayError::HeartbeatTimeout(Duration::from_secs(2)).is_recoverable());
        assert!(QuayError::protocol("bad frame").is_recoverable());
        assert!(!QuayError::config("unknown option foo").is_recoverable());
        assert!(!QuayError::auth("E_UNAUTHORIZED").is_recoverable());
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(QuayError::ConnectionClosed.is_connection_error());
        assert!(!QuayError::HandlerFault("boom".into()).is_connection_error());
    }

    #[test]
    fn test_display() {
        let err = QuayError::FrameTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "Frame too large: 10 bytes (max: 4)");
    }
}
