//! Reconnect backoff for the connection supervisor.
//!
//! Every failed attempt (not found, connect, subscribe, handshake, link loss)
//! waits for the current delay, then grows it by a fixed factor up to a cap.
//! Only reaching streaming resets it, so a device that is found but refuses
//! connections keeps backing off.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options for reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectOptions {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Growth factor applied after each wait.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectOptions {
    /// Create new reconnect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options with a fixed delay (no growth).
    pub fn fixed_delay(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Set initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Validate the options and return an error if invalid.
    ///
    /// Checks that:
    /// - `backoff_multiplier` is finite and >= 1.0
    /// - `initial_delay` is > 0
    /// - `max_delay` >= `initial_delay`
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::InvalidConfig(
                "initial_delay must be > 0".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::InvalidConfig(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Start a backoff sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

/// Running backoff state for one supervisor.
#[derive(Debug, Clone)]
pub struct Backoff {
    options: ReconnectOptions,
    current: Duration,
}

impl Backoff {
    /// Start at the initial delay.
    pub fn new(options: ReconnectOptions) -> Self {
        let current = options.initial_delay;
        Self { options, current }
    }

    /// Delay the next wait will use.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the delay for this wait and grow it for the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = Duration::try_from_secs_f64(
            self.current.as_secs_f64() * self.options.backoff_multiplier,
        )
        .unwrap_or(self.options.max_delay);
        self.current = grown.min(self.options.max_delay);
        delay
    }

    /// Return to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.options.initial_delay;
    }
}
