//! Retry policy for transient backend faults.
//!
//! The wrapper intercepts each unit of work and re-runs it on transient
//! failures (BUSY, LOCKED, short I/O blips) with exponential backoff and a
//! little jitter so competing writers do not re-collide in lockstep.
//! `max_attempts` counts retries after the first attempt; zero means one
//! attempt and no retry.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::Result;

/// Upper bound of the random jitter added to every delay.
const JITTER_MS: u64 = 100;

/// Executes units of work under a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run a unit of work, retrying transient failures per the policy.
    ///
    /// The unit may run several times; it must be side-effect free outside
    /// its own transaction.
    ///
    /// # Errors
    ///
    /// Returns the final error once attempts are exhausted, or immediately
    /// for non-transient kinds.
    pub fn run<T>(&self, operation: &str, mut unit: impl FnMut() -> Result<T>) -> Result<T> {
        let retries_allowed = if self.config.enabled {
            self.config.max_attempts
        } else {
            0
        };

        let mut attempt: u32 = 0;
        loop {
            match unit() {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < retries_allowed => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient backend fault, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() && retries_allowed > 0 {
                        warn!(
                            operation,
                            attempts = attempt + 1,
                            error = %err,
                            "giving up after transient failures"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    /// `min(initial * multiplier^attempt, max) + jitter(0..100ms)`.
    fn delay_for(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let backoff = {
            let exponential = (self.config.initial_delay_ms as f64)
                * self.config.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
            exponential.min(self.config.max_delay_ms as f64) as u64
        };
        let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
        Duration::from_millis(backoff + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use std::cell::Cell;

    fn busy_error() -> Error {
        Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            enabled: true,
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let attempts = Cell::new(0u32);
        let result = fast_policy(3).run("insert", || {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                Err(busy_error())
            } else {
                Ok(attempts.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let attempts = Cell::new(0u32);
        let result: Result<()> = fast_policy(2).run("insert", || {
            attempts.set(attempts.get() + 1);
            Err(busy_error())
        });
        // One initial attempt plus two retries.
        assert_eq!(attempts.get(), 3);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::TransientBackend);
    }

    #[test]
    fn non_transient_errors_propagate_immediately() {
        let attempts = Cell::new(0u32);
        let result: Result<()> = fast_policy(5).run("create", || {
            attempts.set(attempts.get() + 1);
            Err(Error::AlreadyExists {
                entity: "Note".to_string(),
                key: "n1".to_string(),
            })
        });
        assert_eq!(attempts.get(), 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::EntityAlreadyExists);
    }

    #[test]
    fn disabled_policy_runs_exactly_once() {
        let attempts = Cell::new(0u32);
        let policy = RetryPolicy::new(RetryConfig::no_retry());
        let result: Result<()> = policy.run("insert", || {
            attempts.set(attempts.get() + 1);
            Err(busy_error())
        });
        assert_eq!(attempts.get(), 1);
        assert!(result.is_err());
    }

    #[test]
    fn zero_max_attempts_means_one_attempt() {
        let attempts = Cell::new(0u32);
        let result: Result<()> = fast_policy(0).run("insert", || {
            attempts.set(attempts.get() + 1);
            Err(busy_error())
        });
        assert_eq!(attempts.get(), 1);
        assert!(result.is_err());
    }

    #[test]
    fn delay_is_capped_with_jitter() {
        let policy = RetryPolicy::new(RetryConfig {
            enabled: true,
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 400,
            backoff_multiplier: 2.0,
        });
        // attempt 5 would be 3200ms uncapped.
        let delay = policy.delay_for(5);
        assert!(delay >= Duration::from_millis(400));
        assert!(delay < Duration::from_millis(400 + JITTER_MS));
    }
}
