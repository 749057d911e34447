//! Exponential backoff with jitter for the client set's sync loop

use rand::Rng;
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay
    pub initial: Duration,
    /// Maximum delay
    pub max: Duration,
    /// Growth factor applied after each delay
    pub factor: f64,
    /// Jitter fraction: each delay is scaled by a random value in
    /// `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 1.5,
            jitter: 0.1,
        }
    }
}

/// Exponential backoff state
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
        }
    }

    /// Produce the next delay and advance the schedule
    pub fn next_delay(&mut self) -> Duration {
        let jittered = if self.config.jitter > 0.0 {
            let scale = rand::thread_rng()
                .gen_range(1.0 - self.config.jitter..=1.0 + self.config.jitter);
            Duration::from_secs_f64(self.current.as_secs_f64() * scale)
        } else {
            self.current
        };

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.config.factor);
        self.current = next.min(self.config.max);

        jittered
    }

    /// Reset to the initial delay (call after a successful connection)
    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }

    /// The delay the next call to `next_delay` will be based on
    pub fn current(&self) -> Duration {
        self.current
    }
}
