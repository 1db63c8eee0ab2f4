//! Connection events.
//!
//! Every connection reports what happens on it through one typed channel.
//! A reader multiplexes many connections onto a single receiver; each
//! event is tagged with the [`ConnectionId`] it came from.

use bytes::Bytes;
use quay_core::error::QuayError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::identify::IdentifyResponse;
use crate::message::Message;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An `E_*` error frame sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerError {
    pub code: String,
    pub message: String,
}

impl BrokerError {
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();
        match text.split_once(' ') {
            Some((code, message)) => Self {
                code: code.to_string(),
                message: message.to_string(),
            },
            None => Self {
                code: text.to_string(),
                message: String::new(),
            },
        }
    }

    /// Whether the broker closes the connection after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.code.as_str(),
            "E_FIN_FAILED" | "E_REQ_FAILED" | "E_TOUCH_FAILED"
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.code.as_str(), "E_AUTH_FAILED" | "E_UNAUTHORIZED")
    }

    /// Map to the client error taxonomy.
    pub fn into_error(self) -> QuayError {
        if self.is_auth() {
            QuayError::Auth(self.to_string())
        } else {
            QuayError::Protocol(self.to_string())
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.code)
        } else {
            write!(f, "{} {}", self.code, self.message)
        }
    }
}

/// Lifecycle and traffic events of one connection.
///
/// `Closed` is emitted exactly once and is always the last event.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Broker answered IDENTIFY with these features.
    IdentifyResponse(IdentifyResponse),

    /// Handshake complete; the connection accepts SUB and RDY.
    Ready,

    /// A RESPONSE frame other than a heartbeat.
    Response(Bytes),

    /// An ERROR frame.
    Error(BrokerError),

    Message(Message),

    /// Broker heartbeat; already answered with NOP.
    Heartbeat,

    /// Connection is gone. `None` means a requested close.
    Closed(Option<QuayError>),
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentifyResponse(resp) => write!(f, "identify_response max_rdy={}", resp.max_rdy_count),
            Self::Ready => f.write_str("ready"),
            Self::Response(payload) => write!(f, "response {}", String::from_utf8_lossy(payload)),
            Self::Error(err) => write!(f, "error {err}"),
            Self::Message(msg) => write!(f, "message {}", msg.id),
            Self::Heartbeat => f.write_str("heartbeat"),
            Self::Closed(None) => f.write_str("closed"),
            Self::Closed(Some(err)) => write!(f, "closed: {err}"),
        }
    }
}

/// Receiving side of a connection event stream.
pub type EventReceiver = flume::Receiver<(ConnectionId, ConnectionEvent)>;

/// Sending side; one sender may be shared by many connections.
pub type EventSender = flume::Sender<(ConnectionId, ConnectionEvent)>;

#[must_use]
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    flume::unbounded()
}
