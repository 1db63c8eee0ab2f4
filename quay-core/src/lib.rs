//! Quay Core
//!
//! This crate contains the protocol-agnostic building blocks of the client:
//! - Broker addressing (`endpoint`)
//! - Error types (`error`)
//! - Exponential reconnect delay (`reconnect`) and consumer backoff (`backoff`)
//! - Layered transport: raw socket, TLS, compression (`transport`)
//! - Cancellation guard for partial writes (`poison`)
//! - TCP socket tuning (`tcp`)

// The tcp module needs raw fd/socket access for socket configuration
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::match_same_arms)]
pub mod backoff;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod poison;
pub mod reconnect;
pub mod tcp;
pub mod transport;

// Small prelude for downstream protocol crates.
pub mod prelude {
    pub use crate::backoff::{Backoff, BackoffPolicy};
    pub use crate::endpoint::Address;
    pub use crate::error::{QuayError, Result};
    pub use crate::options::TransportOptions;
    pub use crate::poison::PoisonGuard;
    pub use crate::reconnect::ReconnectState;
    pub use crate::transport::compress::Compression;
    pub use crate::transport::tls::TlsOptions;
    pub use crate::transport::{Transport, TransportReader, TransportWriter};
}
