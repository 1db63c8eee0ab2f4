//! # Quay
//!
//! An NSQ client built on `io_uring`.
//!
//! ## Architecture
//!
//! - **`quay-core`**: addresses, errors, backoff, and the layered transport
//!   (TCP or Unix socket, then TLS, then snappy or deflate)
//! - **`quay-nsq`**: frame codec, connection state machine, reader
//!   coordinator and producer
//! - **`quay`**: public API surface (this crate)
//!
//! ## Protocols
//!
//! - **`nsq`** (default) - NSQ TCP protocol V2
//!
//! ## Quick Start
//!
//! ### Consuming
//!
//! ```rust,no_run
//! # #[cfg(feature = "nsq")]
//! use quay::nsq::prelude::*;
//!
//! # #[cfg(feature = "nsq")]
//! struct Archive;
//!
//! # #[cfg(feature = "nsq")]
//! #[async_trait(?Send)]
//! impl Handler for Archive {
//!     async fn handle(&self, message: &Message) -> Outcome {
//!         println!("{} (attempt {})", message.id, message.attempts);
//!         Outcome::Completed
//!     }
//! }
//!
//! # #[cfg(feature = "nsq")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let reader = Reader::start(
//!     [Address::tcp("127.0.0.1", 4150)],
//!     "events",
//!     "archive",
//!     Archive,
//!     ReaderConfig::default().with_max_in_flight(50),
//! )?;
//! // ... later
//! reader.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Publishing
//!
//! ```rust,no_run
//! # #[cfg(feature = "nsq")]
//! use quay::nsq::prelude::*;
//!
//! # #[cfg(feature = "nsq")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let address = Address::tcp("127.0.0.1", 4150);
//! let mut producer = Producer::connect(&address, &ConnectionConfig::default()).await?;
//! producer.publish("events", "hello").await?;
//! producer.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Runtime
//!
//! Everything runs on a single-threaded `compio` runtime. Readers and
//! producers must be created inside one, and their handles are not `Send`.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;
pub use quay_core::endpoint::Address;
pub use quay_core::error::{QuayError, Result};

pub mod dev_tracing;

// Protocol modules
#[cfg(feature = "nsq")]
pub mod nsq;
