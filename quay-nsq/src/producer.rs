//! Publisher over a single broker connection.
//!
//! The broker answers publishes in order, so each call waits for the next
//! response on its own event stream.

use bytes::Bytes;
use quay_core::endpoint::Address;
use quay_core::error::{QuayError, Result};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::events::{create_event_channel, ConnectionEvent, EventReceiver};

/// A publishing connection.
///
/// # Examples
///
/// ```no_run
/// use quay_core::endpoint::Address;
/// use quay_nsq::config::ConnectionConfig;
/// use quay_nsq::producer::Producer;
///
/// # async fn demo() -> quay_core::error::Result<()> {
/// let mut producer =
///     Producer::connect(&Address::tcp("127.0.0.1", 4150), &ConnectionConfig::default()).await?;
/// producer.publish("events", "hello").await?;
/// producer.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Producer {
    conn: Connection,
    events: EventReceiver,
}

impl Producer {
    pub async fn connect(address: &Address, config: &ConnectionConfig) -> Result<Self> {
        let (tx, events) = create_event_channel();
        let conn = Connection::connect(address, config, tx).await?;
        Ok(Self { conn, events })
    }

    #[inline]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Publish one message and wait for the broker's `OK`.
    pub async fn publish(&mut self, topic: &str, body: impl Into<Bytes>) -> Result<()> {
        self.conn.publish(topic, body)?;
        self.await_ok("PUB").await
    }

    /// Publish several messages atomically.
    pub async fn multi_publish(&mut self, topic: &str, bodies: Vec<Bytes>) -> Result<()> {
        self.conn.multi_publish(topic, bodies)?;
        self.await_ok("MPUB").await
    }

    /// Publish a message that becomes visible after `delay`.
    pub async fn deferred_publish(
        &mut self,
        topic: &str,
        delay: Duration,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.conn.deferred_publish(topic, delay, body)?;
        self.await_ok("DPUB").await
    }

    async fn await_ok(&mut self, verb: &str) -> Result<()> {
        loop {
            let (_, event) = self
                .events
                .recv_async()
                .await
                .map_err(|_| QuayError::ChannelClosed)?;
            match event {
                ConnectionEvent::Response(payload) => {
                    trace!("[PRODUCER] {} → {}", verb, String::from_utf8_lossy(&payload));
                    return Ok(());
                }
                ConnectionEvent::Error(err) => {
                    debug!("[PRODUCER] {} rejected: {}", verb, err);
                    return Err(QuayError::Protocol(err.to_string()));
                }
                ConnectionEvent::Closed(err) => {
                    return Err(err.unwrap_or(QuayError::ConnectionClosed));
                }
                _ => {}
            }
        }
    }

    /// Close the connection and wait until it is gone.
    pub async fn close(self) {
        if self.conn.close().is_err() {
            return;
        }
        while let Ok((_, event)) = self.events.recv_async().await {
            if matches!(event, ConnectionEvent::Closed(_)) {
                break;
            }
        }
    }
}
