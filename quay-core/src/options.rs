//! Transport configuration options

use std::time::Duration;

/// Socket-level options applied when a transport is opened.
///
/// # Examples
///
/// ```
/// use quay_core::options::TransportOptions;
/// use std::time::Duration;
///
/// let opts = TransportOptions::default()
///     .with_connect_timeout(Duration::from_secs(2))
///     .with_read_buffer_size(64 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Maximum time to wait for the socket connect to complete.
    ///
    /// - Default: 1 second
    pub connect_timeout: Duration,

    /// Size of each socket read (bytes)
    ///
    /// - Default: 16384 (16KB)
    pub read_buffer_size: usize,

    /// Disable Nagle's algorithm on TCP sockets.
    ///
    /// - Default: true
    pub tcp_nodelay: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            read_buffer_size: 16 * 1024,
            tcp_nodelay: true,
        }
    }
}

impl TransportOptions {
    /// Set connect timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set read buffer size
    #[must_use]
    pub const fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Enable or disable `TCP_NODELAY`
    #[must_use]
    pub const fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}
