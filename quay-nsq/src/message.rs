//! Delivered messages.
//!
//! Payload of a MESSAGE frame:
//!
//! ```text
//! [ timestamp: i64 BE ns ][ attempts: u16 BE ][ id: 16 bytes ][ body ... ]
//! ```

use bytes::{Buf, Bytes};
use quay_core::error::{QuayError, Result};
use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::debug;

use crate::command::Command;
use crate::connection::ConnectionShared;
use crate::events::ConnectionId;

const HEADER_LEN: usize = 8 + 2 + 16;

/// 16-byte message identifier, as assigned by the broker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse from the textual form used in commands.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes: [u8; 16] = s
            .as_bytes()
            .try_into()
            .map_err(|_| QuayError::protocol(format!("message id {s:?} is not 16 bytes")))?;
        Ok(Self(bytes))
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// A message delivered by one broker connection.
///
/// Cloning is cheap and clones share the responded flag, so a message is
/// finished or requeued at most once no matter which clone does it.
#[derive(Clone)]
pub struct Message {
    pub id: MessageId,
    pub attempts: u16,
    /// Broker timestamp in nanoseconds since the Unix epoch
    pub timestamp: i64,
    pub body: Bytes,
    origin: Weak<ConnectionShared>,
    responded: Rc<Cell<bool>>,
}

impl Message {
    /// Decode a MESSAGE frame payload.
    pub(crate) fn decode(mut payload: Bytes, origin: Weak<ConnectionShared>) -> Result<Self> {
        if payload.len() < HEADER_LEN {
            return Err(QuayError::protocol(format!(
                "message frame of {} bytes is shorter than its header",
                payload.len()
            )));
        }
        let timestamp = payload.get_i64();
        let attempts = payload.get_u16();
        let mut id = [0u8; 16];
        payload.copy_to_slice(&mut id);
        Ok(Self {
            id: MessageId(id),
            attempts,
            timestamp,
            body: payload,
            origin,
            responded: Rc::new(Cell::new(false)),
        })
    }

    /// Build a detached message, not tied to any connection. Responses on
    /// it are dropped.
    pub fn detached(id: MessageId, attempts: u16, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            attempts,
            timestamp: 0,
            body: body.into(),
            origin: Weak::new(),
            responded: Rc::new(Cell::new(false)),
        }
    }

    /// Whether `finish` or `requeue` already ran.
    #[inline]
    pub fn has_responded(&self) -> bool {
        self.responded.get()
    }

    /// Acknowledge successful processing (`FIN`).
    pub fn finish(&self) -> Result<()> {
        self.mark_responded()?;
        self.respond(Command::Fin(self.id), true);
        Ok(())
    }

    /// Ask the broker to redeliver after `delay` (`REQ`).
    pub fn requeue(&self, delay: Duration) -> Result<()> {
        self.mark_responded()?;
        self.respond(
            Command::Req {
                id: self.id,
                delay,
            },
            true,
        );
        Ok(())
    }

    /// Reset the broker-side processing timeout (`TOUCH`).
    pub fn touch(&self) -> Result<()> {
        if self.has_responded() {
            return Err(QuayError::AlreadyResponded(self.id.to_string()));
        }
        self.respond(Command::Touch(self.id), false);
        Ok(())
    }

    /// Connection that delivered this message, while it is alive.
    pub(crate) fn origin_id(&self) -> Option<ConnectionId> {
        self.origin.upgrade().map(|conn| conn.id())
    }

    fn mark_responded(&self) -> Result<()> {
        if self.responded.replace(true) {
            return Err(QuayError::AlreadyResponded(self.id.to_string()));
        }
        Ok(())
    }

    // Responses are best-effort once the connection is gone; the broker
    // requeues on its own timeout.
    fn respond(&self, cmd: Command, completes: bool) {
        match self.origin.upgrade() {
            Some(conn) => conn.respond(cmd, completes),
            None => debug!("[MSG] {} dropped {}: connection gone", self.id, cmd.verb()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("timestamp", &self.timestamp)
            .field("body_len", &self.body.len())
            .field("responded", &self.has_responded())
            .finish()
    }
}
