//! Consumer backoff.
//!
//! A failed message raises the backoff level, consecutive successes lower it.
//! The delay before the next trial grows as `base_delay * 2^level`, capped at
//! `max_delay`. Level 0 means the consumer is running normally.

use rand::Rng;
use std::time::Duration;

/// Tunables for the backoff curve.
///
/// # Examples
///
/// ```
/// use quay_core::backoff::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::default()
///     .with_base_delay(Duration::from_millis(250))
///     .with_max_level(4);
/// assert_eq!(policy.delay_for(2), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay at level 1 is `2 * base_delay`.
    ///
    /// - Default: 1 second
    pub base_delay: Duration,

    /// Upper bound on any computed delay.
    ///
    /// - Default: 128 seconds
    pub max_delay: Duration,

    /// Highest reachable level. Failures past this level keep the delay flat.
    ///
    /// - Default: 8
    pub max_level: u32,

    /// Consecutive successes needed to step one level down.
    ///
    /// - Default: 1
    pub success_threshold: u32,

    /// Random spread applied to each delay, as a fraction (0.0 to 1.0).
    ///
    /// - Default: 0.0 (deterministic)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(128),
            max_level: 8,
            success_threshold: 1,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Set the base delay
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the highest level
    #[must_use]
    pub const fn with_max_level(mut self, level: u32) -> Self {
        self.max_level = level;
        self
    }

    /// Set the number of successes required per level decrease
    #[must_use]
    pub const fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the jitter fraction
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the policy for values that make the curve meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("backoff base_delay must be positive".into());
        }
        if self.max_delay < self.base_delay {
            return Err("backoff max_delay must be >= base_delay".into());
        }
        if self.success_threshold == 0 {
            return Err("backoff success_threshold must be >= 1".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("backoff jitter {} outside 0.0..=1.0", self.jitter));
        }
        Ok(())
    }

    /// Un-jittered delay for a given level.
    #[must_use]
    pub fn delay_for(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }
        // 2^31 seconds already exceeds any sane cap
        let factor = 1_u32 << level.min(31);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Backoff state: the current level and the success streak.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    level: u32,
    successes: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            level: 0,
            successes: 0,
        }
    }

    /// Record a failure. Returns the new level.
    pub fn on_failure(&mut self) -> u32 {
        self.successes = 0;
        self.level = (self.level + 1).min(self.policy.max_level);
        self.level
    }

    /// Record a success. Returns the new level.
    pub fn on_success(&mut self) -> u32 {
        if self.level == 0 {
            return 0;
        }
        self.successes += 1;
        if self.successes >= self.policy.success_threshold {
            self.successes = 0;
            self.level -= 1;
        }
        self.level
    }

    #[inline]
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level
    }

    #[inline]
    #[must_use]
    pub const fn is_throttled(&self) -> bool {
        self.level > 0
    }

    #[must_use]
    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Delay before the next trial at the current level, with jitter applied.
    #[must_use]
    pub fn delay(&self) -> Duration {
        let delay = self.policy.delay_for(self.level);
        if self.policy.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.policy.jitter..=self.policy.jitter);
        delay.mul_f64(1.0 + spread).min(self.policy.max_delay)
    }

    /// Drop straight back to level 0.
    pub fn reset(&mut self) {
        self.level = 0;
        self.successes = 0;
    }
}
