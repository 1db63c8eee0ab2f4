//! Broker discovery.
//!
//! A reader asks its [`Discovery`] for the brokers carrying a topic on a
//! timer. Failures are logged by the reader and treated as "no change".

use async_trait::async_trait;
use quay_core::endpoint::Address;
use quay_core::error::{QuayError, Result};
use serde::Deserialize;

/// Topic → broker address lookup.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use quay_core::endpoint::Address;
/// use quay_core::error::Result;
/// use quay_nsq::discovery::{parse_lookup_response, Discovery};
///
/// struct Cached(Vec<u8>);
///
/// #[async_trait(?Send)]
/// impl Discovery for Cached {
///     async fn lookup(&self, _topic: &str) -> Result<Vec<Address>> {
///         parse_lookup_response(&self.0)
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait Discovery {
    async fn lookup(&self, topic: &str) -> Result<Vec<Address>>;
}

/// Fixed address list.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    addresses: Vec<Address>,
}

impl StaticDiscovery {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }
}

#[async_trait(?Send)]
impl Discovery for StaticDiscovery {
    async fn lookup(&self, _topic: &str) -> Result<Vec<Address>> {
        Ok(self.addresses.clone())
    }
}

#[derive(Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

#[derive(Deserialize)]
struct Producers {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LookupBody {
    // Older lookupd versions wrap the payload in {"status_code", "data"}.
    Wrapped { data: Producers },
    Plain(Producers),
}

/// Parse a lookupd `/lookup?topic=` response body.
///
/// Duplicate producers collapse into one address.
pub fn parse_lookup_response(body: &[u8]) -> Result<Vec<Address>> {
    let parsed: LookupBody = serde_json::from_slice(body)
        .map_err(|e| QuayError::protocol(format!("bad lookup response: {e}")))?;
    let producers = match parsed {
        LookupBody::Wrapped { data } => data.producers,
        LookupBody::Plain(p) => p.producers,
    };
    let mut addresses: Vec<Address> = producers
        .into_iter()
        .map(|p| Address::tcp(p.broadcast_address, p.tcp_port))
        .collect();
    addresses.sort();
    addresses.dedup();
    Ok(addresses)
}
