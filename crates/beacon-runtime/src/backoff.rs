use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// First delay after a failure.
    pub base: Duration,
    /// Ceiling for the delay.
    pub max: Duration,
    /// Growth factor between consecutive failures.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Capped exponential backoff. Delays never decrease until `reset`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.base.min(config.max);
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// Delay to wait before the next retry; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);

        let grown = self.current.mul_f64(self.config.multiplier.max(1.0));
        self.current = grown.min(self.config.max).max(delay);

        delay
    }

    /// Jump straight to the ceiling, for failures a quick retry will not fix.
    pub fn next_max_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.current = self.config.max;
        self.current
    }

    /// Back to the base delay after a success.
    pub fn reset(&mut self) {
        self.current = self.config.base.min(self.config.max);
        self.attempts = 0;
    }

    /// Failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
