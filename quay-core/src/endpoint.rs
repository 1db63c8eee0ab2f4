//! Broker addressing.
//!
//! A broker is reached over TCP (`host:port`) or, for local testing, over a
//! filesystem socket path.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Address of one broker daemon. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    /// TCP transport: `tcp://host:port` or `host:port`
    Tcp { host: String, port: u16 },
    /// Filesystem socket: `unix:///path/to/socket` or an absolute path
    Unix(PathBuf),
}

impl Address {
    /// Build a TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Build a filesystem socket address.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    /// Parse an address from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:4150`
    /// - `nsqd.local:4150`
    /// - `[::1]:4150` (IPv6)
    /// - `unix:///tmp/nsqd.sock`
    /// - `/tmp/nsqd.sock`
    ///
    /// # Examples
    ///
    /// ```
    /// use quay_core::endpoint::Address;
    ///
    /// let addr = Address::parse("tcp://127.0.0.1:4150").unwrap();
    /// assert!(addr.is_tcp());
    ///
    /// let addr = Address::parse("/tmp/nsqd.sock").unwrap();
    /// assert!(!addr.is_tcp());
    /// ```
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        s.parse()
    }

    /// Returns true if this is a TCP address.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Address::Tcp { .. })
    }

    /// Host name used for TLS server name indication.
    pub fn host(&self) -> Option<&str> {
        match self {
            Address::Tcp { host, .. } => Some(host),
            Address::Unix(_) => None,
        }
    }
}

fn parse_host_port(s: &str) -> Result<Address, AddressError> {
    let invalid = || AddressError::InvalidTcpAddress(s.to_string());

    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        // [v6]:port
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, port)
    } else {
        s.rsplit_once(':').ok_or_else(invalid)?
    };

    if host.is_empty() || host.contains(':') && !s.starts_with('[') {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok(Address::tcp(host, port))
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            parse_host_port(addr)
        } else if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                Err(AddressError::InvalidPath(s.to_string()))
            } else {
                Ok(Address::Unix(PathBuf::from(path)))
            }
        } else if s.starts_with('/') {
            Ok(Address::Unix(PathBuf::from(s)))
        } else if s.contains("://") {
            Err(AddressError::InvalidScheme(s.to_string()))
        } else {
            parse_host_port(s)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Errors that can occur when parsing addresses.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("Invalid scheme in address: {0} (expected tcp:// or unix://)")]
    InvalidScheme(String),

    #[error("Invalid TCP address: {0}")]
    InvalidTcpAddress(String),

    #[error("Invalid socket path: {0}")]
    InvalidPath(String),
}
