//! Reconnect delay calculation for the event stream.
use std::time::{Duration, Instant};

/// Configuration for [`BackoffCalculator`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_INITIAL_DELAY`].
    pub initial_delay: Duration,
    /// Factor applied to the delay after every attempt.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_MULTIPLIER`].
    pub multiplier: f64,
    /// Upper bound for a single delay.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_MAX_DELAY`].
    pub max_delay: Duration,
}

impl BackoffConfig {
    /// Default value for [`BackoffConfig::initial_delay`].
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
    /// Default value for [`BackoffConfig::multiplier`].
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;
    /// Default value for [`BackoffConfig::max_delay`].
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Create a new `BackoffConfig` using default configuration.
    pub fn new() -> BackoffConfig {
        BackoffConfig::default()
    }

    /// Update initial delay with `initial_delay`.
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> BackoffConfig {
        self.initial_delay = initial_delay;
        self
    }

    /// Update multiplier with `multiplier`.
    pub fn with_multiplier(mut self, multiplier: f64) -> BackoffConfig {
        self.multiplier = multiplier;
        self
    }

    /// Update maximum delay with `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> BackoffConfig {
        self.max_delay = max_delay;
        self
    }
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            initial_delay: BackoffConfig::DEFAULT_INITIAL_DELAY,
            multiplier: BackoffConfig::DEFAULT_MULTIPLIER,
            max_delay: BackoffConfig::DEFAULT_MAX_DELAY,
        }
    }
}

/// Capped exponential backoff.
///
/// The only state is the attempt counter (plus the time of the last attempt, kept for
/// diagnostics), so the sequence of delays is fully determined by the configuration and the order
/// of `next_delay()`/`reset()` calls.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
    attempt_count: u32,
    last_attempt_at: Option<Instant>,
}

impl BackoffCalculator {
    #[allow(missing_docs)]
    pub fn new(config: BackoffConfig) -> BackoffCalculator {
        BackoffCalculator {
            config,
            attempt_count: 0,
            last_attempt_at: None,
        }
    }

    /// Returns `min(initial_delay × multiplier^attempt_count, max_delay)` and counts the attempt.
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use flagsync::{BackoffCalculator, BackoffConfig};
    /// let mut backoff = BackoffCalculator::new(
    ///     BackoffConfig::new().with_max_delay(Duration::from_secs(5)),
    /// );
    /// let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
    /// assert_eq!(delays, [1, 2, 4, 5, 5]);
    /// ```
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.record_attempt();
        delay
    }

    /// The delay `next_delay()` would return, without counting an attempt.
    pub fn current_delay(&self) -> Duration {
        let max = self.config.max_delay.as_secs_f64();
        let exponent = i32::try_from(self.attempt_count).unwrap_or(i32::MAX);
        let delay = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        if delay.is_finite() && delay < max {
            Duration::from_secs_f64(delay.max(0.0))
        } else {
            self.config.max_delay
        }
    }

    /// Count a reconnect attempt that happens without waiting.
    pub fn record_attempt(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(Instant::now());
    }

    /// Start the sequence over. Called when data is received.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Number of attempts since the last reset.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// When the last attempt was counted.
    pub fn last_attempt_at(&self) -> Option<Instant> {
        self.last_attempt_at
    }
}
