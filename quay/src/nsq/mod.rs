//! NSQ protocol implementation.
//!
//! # Types
//!
//! - [`Reader`] - consumer for one topic/channel across many brokers
//! - [`Producer`] - publisher over a single broker connection
//! - [`Connection`] - one broker connection, for custom coordination
//!
//! # Consumer flow control
//!
//! A reader never has more than `max_in_flight` messages outstanding across
//! all of its connections. When a handler fails the reader backs off: it
//! withdraws all credit and lets exactly one message through per backoff
//! window until handlers succeed again.
//!
//! ```rust,no_run
//! use quay::nsq::{ReaderConfig, BackoffPolicy};
//! use std::time::Duration;
//!
//! let config = ReaderConfig::default()
//!     .with_max_in_flight(200)
//!     .with_max_attempts(5)
//!     .with_backoff(BackoffPolicy::default().with_max_delay(Duration::from_secs(60)));
//! ```

pub use quay_core::backoff::BackoffPolicy;
pub use quay_core::options::TransportOptions;
pub use quay_core::transport::tls::TlsOptions;

pub use quay_nsq::config::{ConnectionConfig, ReaderConfig};
pub use quay_nsq::connection::{Connection, ConnectionState};
pub use quay_nsq::discovery::{parse_lookup_response, Discovery, StaticDiscovery};
pub use quay_nsq::events::{
    create_event_channel, BrokerError, ConnectionEvent, ConnectionId, EventReceiver, EventSender,
};
pub use quay_nsq::identify::{IdentifyOptions, IdentifyResponse};
pub use quay_nsq::message::{Message, MessageId};
pub use quay_nsq::producer::Producer;
pub use quay_nsq::reader::{Handler, Outcome, Reader, ReaderStats};

/// Convenient imports for NSQ.
///
/// # Example
///
/// ```rust
/// use quay::nsq::prelude::*;
///
/// // Now you have:
/// // - Reader, Handler, Outcome, Message, Producer
/// // - ReaderConfig, ConnectionConfig, IdentifyOptions
/// // - Address, Bytes and the async_trait attribute
/// ```
pub mod prelude {
    pub use super::{
        ConnectionConfig, Handler, IdentifyOptions, Message, Outcome, Producer, Reader,
        ReaderConfig,
    };
    pub use async_trait::async_trait;
    pub use bytes::Bytes;
    pub use quay_core::endpoint::Address;
}
