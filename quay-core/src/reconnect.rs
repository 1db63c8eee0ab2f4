//! Reconnection delay with exponential growth.
//!
//! One `ReconnectState` is kept per broker address. Every failed connect or
//! lost connection asks for the next delay; a completed handshake resets it.

use std::time::Duration;

/// Delay schedule for one broker address.
///
/// # Example
///
/// ```rust
/// use quay_core::reconnect::ReconnectState;
/// use std::time::Duration;
///
/// let mut reconnect = ReconnectState::new(Duration::from_millis(100), Duration::from_secs(10));
///
/// // The first retry waits the base interval
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
///
/// // then doubles
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(200));
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(400));
///
/// // until the broker is reachable again
/// reconnect.reset();
/// assert_eq!(reconnect.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectState {
    base_interval: Duration,
    max_interval: Duration,
    /// Failed attempts since the last reset
    attempt: u32,
    current_interval: Duration,
}

impl ReconnectState {
    /// Create a tracker that starts at `base` and doubles up to `max`.
    ///
    /// A `max` below `base` pins every delay to `base`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_interval: base,
            max_interval: max.max(base),
            attempt: 0,
            current_interval: base,
        }
    }

    /// Delay before the next attempt. Each call doubles the following one,
    /// up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;

        self.attempt = self.attempt.saturating_add(1);
        self.current_interval = self
            .base_interval
            .saturating_mul(1_u32 << self.attempt.min(16))
            .min(self.max_interval);

        delay
    }

    /// Back to the base interval once a connection is live again.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay the next call to `next_delay` will return.
    #[inline]
    #[must_use]
    pub const fn current_interval(&self) -> Duration {
        self.current_interval
    }
}
