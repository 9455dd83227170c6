//! Exponential backoff with jitter for transient failures.

use std::time::Duration;

use tracing::warn;

/// Errors that can opt in to retrying.
pub trait Retryable {
    fn is_recoverable(&self) -> bool;
}

impl Retryable for crate::error::Error {
    fn is_recoverable(&self) -> bool {
        self.is_recoverable()
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

/// Retries an operation while its error reports as recoverable.
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(config: RetryConfig) -> Self {
        Self { config }
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp_delay = self.config.base_delay * (2u32.pow(attempt.saturating_sub(1)));
        let delay = std::cmp::min(exp_delay, self.config.max_delay);

        if self.config.jitter_factor > 0.0 {
            let jitter_range = delay.as_millis() as f64 * self.config.jitter_factor;
            let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
            let adjusted_ms = (delay.as_millis() as f64 + jitter).max(0.0);
            Duration::from_millis(adjusted_ms as u64)
        } else {
            delay
        }
    }

    pub fn execute<F, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Result<T, E>,
        E: Retryable + std::fmt::Debug,
    {
        let mut attempt = 0;

        loop {
            match operation() {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_recoverable() || attempt >= self.config.max_retries {
                        return Err(e);
                    }

                    attempt += 1;
                    let delay = self.calculate_delay(attempt);

                    warn!(
                        "Retry attempt {}/{} failed: {:?}, retrying in {:?}",
                        attempt, self.config.max_retries, e, delay
                    );

                    std::thread::sleep(delay);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct Transient(bool);

    impl Retryable for Transient {
        fn is_recoverable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn retries_recoverable_until_success() {
        let attempts = Cell::new(0u32);
        let policy = RetryPolicy::with_config(RetryConfig {
            base_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        });

        let result: Result<u32, Transient> = policy.execute(|| {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                Err(Transient(true))
            } else {
                Ok(attempts.get())
            }
        });

        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_on_unrecoverable() {
        let attempts = Cell::new(0u32);
        let policy = RetryPolicy::new();

        let result: Result<(), Transient> = policy.execute(|| {
            attempts.set(attempts.get() + 1);
            Err(Transient(false))
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn respects_max_retries() {
        let attempts = Cell::new(0u32);
        let policy = RetryPolicy::with_config(
            RetryConfig {
                base_delay: Duration::from_millis(1),
                ..RetryConfig::default()
            }
            .with_max_retries(2),
        );

        let result: Result<(), Transient> = policy.execute(|| {
            attempts.set(attempts.get() + 1);
            Err(Transient(true))
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 3); // initial try + 2 retries
    }
}
