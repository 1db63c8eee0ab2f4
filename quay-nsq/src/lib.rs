//! # Quay NSQ
//!
//! NSQ client protocol on top of `quay-core`.
//!
//! ## Overview
//!
//! - **Codec**: length-prefixed broker frames and line-based client commands
//! - **Connection**: handshake (IDENTIFY, TLS, compression, AUTH), then a
//!   reader task and a writer task per broker
//! - **Reader**: consumer coordinator that spreads RDY credit over
//!   connections, backs off after handler failures and follows discovery
//! - **Producer**: publishes and waits for the broker's acknowledgement
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use quay_core::endpoint::Address;
//! use quay_nsq::prelude::*;
//!
//! struct Print;
//!
//! #[async_trait(?Send)]
//! impl Handler for Print {
//!     async fn handle(&self, message: &Message) -> Outcome {
//!         println!("{:?}", message.body);
//!         Outcome::Completed
//!     }
//! }
//!
//! #[compio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reader = Reader::start(
//!         [Address::tcp("127.0.0.1", 4150)],
//!         "events",
//!         "archive",
//!         Print,
//!         ReaderConfig::default().with_max_in_flight(100),
//!     )?;
//!     compio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     reader.close().await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::let_underscore_future)]

pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod events;
pub mod identify;
pub mod message;
pub mod producer;
pub mod rdy;
pub mod reader;

pub use config::{ConnectionConfig, ReaderConfig};
pub use connection::{Connection, ConnectionState};
pub use message::{Message, MessageId};
pub use producer::Producer;
pub use reader::{Handler, Outcome, Reader, ReaderStats};

pub mod prelude {
    pub use crate::config::{ConnectionConfig, ReaderConfig};
    pub use crate::connection::{Connection, ConnectionState};
    pub use crate::discovery::{Discovery, StaticDiscovery};
    pub use crate::events::{create_event_channel, ConnectionEvent, ConnectionId};
    pub use crate::identify::IdentifyOptions;
    pub use crate::message::{Message, MessageId};
    pub use crate::producer::Producer;
    pub use crate::reader::{Handler, Outcome, Reader, ReaderStats};
}
