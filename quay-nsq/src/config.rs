//! Connection and reader configuration
//!
//! Option structs with public fields, documented defaults and chainable
//! `with_*` setters. `validate()` runs before any socket is opened.

use quay_core::backoff::BackoffPolicy;
use quay_core::error::{QuayError, Result};
use quay_core::options::TransportOptions;
use quay_core::transport::tls::TlsOptions;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::identify::IdentifyOptions;

/// Default grace period for `CLS` and reader shutdown (30s)
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on the whole handshake (magic through AUTH) (10s)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// IDENTIFY document sent during the handshake.
    pub identify: IdentifyOptions,

    /// Secret sent with `AUTH` when the broker requires authorization.
    ///
    /// - Default: None
    pub auth_secret: Option<String>,

    /// TLS settings. Setting this also requests `tls_v1` in IDENTIFY.
    ///
    /// - Default: None (plaintext)
    pub tls: Option<TlsOptions>,

    /// Socket options (connect timeout, read size, `TCP_NODELAY`).
    pub transport: TransportOptions,

    /// Largest frame accepted from the broker.
    ///
    /// - Default: 16 MiB
    pub max_frame_size: usize,

    /// How long `close()` waits for the broker to close its side.
    ///
    /// - Default: 30 seconds
    pub close_timeout: Duration,

    /// Bound on the handshake after the socket connects.
    ///
    /// - Default: 10 seconds
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            identify: IdentifyOptions::default(),
            auth_secret: None,
            tls: None,
            transport: TransportOptions::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn with_identify(mut self, identify: IdentifyOptions) -> Self {
        self.identify = identify;
        self
    }

    #[must_use]
    pub fn with_auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth_secret = Some(secret.into());
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.identify.tls_v1 = true;
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.identify.validate()?;
        if self.identify.tls_v1 && self.tls.is_none() {
            return Err(QuayError::config("tls_v1 requested without TLS options"));
        }
        if self.max_frame_size < 8 {
            return Err(QuayError::config("max_frame_size must be at least 8 bytes"));
        }
        if self.transport.read_buffer_size == 0 {
            return Err(QuayError::config("read_buffer_size must be non-zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(QuayError::config("handshake_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Consumer configuration.
///
/// # Examples
///
/// ```
/// use quay_nsq::config::ReaderConfig;
/// use std::time::Duration;
///
/// let config = ReaderConfig::default()
///     .with_max_in_flight(200)
///     .with_lookup_interval(Duration::from_secs(15));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Total messages in flight across all connections.
    ///
    /// - Default: 1
    pub max_in_flight: u64,

    /// Deliveries after which `Handler::giving_up` runs instead of `handle`.
    ///
    /// - Default: 0 (unlimited)
    pub max_attempts: u16,

    /// Requeue delay per attempt when the handler gives none.
    ///
    /// - Default: 90 seconds
    pub requeue_delay: Duration,

    /// Ceiling for the computed requeue delay.
    ///
    /// - Default: 15 minutes
    pub max_requeue_delay: Duration,

    /// Period of the RDY rebalancing tick.
    ///
    /// - Default: 5 seconds
    pub redistribute_interval: Duration,

    /// When connections outnumber `max_in_flight`, a connection holding RDY
    /// without receiving for this long gives up its slot.
    ///
    /// - Default: 10 seconds
    pub low_rdy_idle_timeout: Duration,

    /// Period of discovery lookups.
    ///
    /// - Default: 60 seconds
    pub lookup_interval: Duration,

    /// Fraction of `lookup_interval` used to randomize the first lookup.
    ///
    /// - Default: 0.3
    pub lookup_jitter: f64,

    /// First reconnect delay after a connection is lost.
    ///
    /// - Default: 15 seconds
    pub reconnect_interval: Duration,

    /// Reconnect delay ceiling.
    ///
    /// - Default: 2 minutes
    pub reconnect_interval_max: Duration,

    /// How long `close()` waits for in-flight messages to drain.
    ///
    /// - Default: 30 seconds
    pub close_timeout: Duration,

    pub backoff: BackoffPolicy,

    pub connection: ConnectionConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            max_attempts: 0,
            requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            redistribute_interval: Duration::from_secs(5),
            low_rdy_idle_timeout: Duration::from_secs(10),
            lookup_interval: Duration::from_secs(60),
            lookup_jitter: 0.3,
            reconnect_interval: Duration::from_secs(15),
            reconnect_interval_max: Duration::from_secs(120),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            backoff: BackoffPolicy::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ReaderConfig {
    #[must_use]
    pub const fn with_max_in_flight(mut self, max: u64) -> Self {
        self.max_in_flight = max;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max: u16) -> Self {
        self.max_attempts = max;
        self
    }

    #[must_use]
    pub const fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_redistribute_interval(mut self, interval: Duration) -> Self {
        self.redistribute_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_lookup_interval(mut self, interval: Duration) -> Self {
        self.lookup_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_reconnect_interval(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_interval = base;
        self.reconnect_interval_max = max;
        self
    }

    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(QuayError::config("max_in_flight must be at least 1"));
        }
        if self.requeue_delay > self.max_requeue_delay {
            return Err(QuayError::config("requeue_delay exceeds max_requeue_delay"));
        }
        if self.redistribute_interval.is_zero() {
            return Err(QuayError::config("redistribute_interval must be non-zero"));
        }
        if self.lookup_interval.is_zero() {
            return Err(QuayError::config("lookup_interval must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.lookup_jitter) {
            return Err(QuayError::config("lookup_jitter must be within 0.0..=1.0"));
        }
        if self.reconnect_interval.is_zero() {
            return Err(QuayError::config("reconnect_interval must be non-zero"));
        }
        self.backoff.validate().map_err(QuayError::Configuration)?;
        self.connection.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ConnectionConfig::default().validate().is_ok());
        assert!(ReaderConfig::default().validate().is_ok());
        assert_eq!(ReaderConfig::default().max_in_flight, 1);
    }

    #[test]
    fn test_with_tls_requests_tls_v1() {
        let config = ConnectionConfig::default().with_tls(TlsOptions::insecure());
        assert!(config.identify.tls_v1);
        assert!(config.validate().is_ok());

        let mut missing = ConnectionConfig::default();
        missing.identify.tls_v1 = true;
        assert!(matches!(missing.validate(), Err(QuayError::Configuration(_))));
    }

    #[test]
    fn test_reader_validation() {
        assert!(ReaderConfig::default().with_max_in_flight(0).validate().is_err());
        assert!(ReaderConfig::default()
            .with_requeue_delay(Duration::from_secs(3600))
            .validate()
            .is_err());
        let bad_backoff = BackoffPolicy::default().with_success_threshold(0);
        assert!(ReaderConfig::default().with_backoff(bad_backoff).validate().is_err());
    }

    #[test]
    fn test_identify_errors_surface() {
        let config = ReaderConfig::default().with_connection(
            ConnectionConfig::default().with_identify(IdentifyOptions::default().with_deflate(0)),
        );
        assert!(matches!(config.validate(), Err(QuayError::Configuration(_))));
    }
}
