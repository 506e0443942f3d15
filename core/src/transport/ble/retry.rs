// Bounded retry for transient radio contention

use super::capability::CapabilityError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given retry attempt (0-based), capped
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff_ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(16)));
        Duration::from_millis(backoff_ms.min(self.max_backoff_ms))
    }

    /// Run `op`, retrying transient capability errors until attempts run out.
    ///
    /// Non-transient errors return immediately.
    pub async fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, CapabilityError>
    where
        F: FnMut() -> Result<T, CapabilityError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.backoff_duration(attempt);
                    debug!("{} failed ({}), retrying in {:?}", what, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_duration(10), Duration::from_millis(5_000));
        assert_eq!(policy.backoff_duration(u32::MAX), Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_is_retried_until_success() {
        let policy = RetryPolicy::default();
        let mut calls = 0;

        let result = policy
            .run("start", || {
                calls += 1;
                if calls < 3 {
                    Err(CapabilityError::Busy)
                } else {
                    Ok(calls)
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let mut calls = 0;

        let result: Result<(), _> = policy
            .run("start", || {
                calls += 1;
                Err(CapabilityError::Busy)
            })
            .await;

        assert_eq!(result, Err(CapabilityError::Busy));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let mut calls = 0;

        let result: Result<(), _> = policy
            .run("start", || {
                calls += 1;
                Err(CapabilityError::BluetoothOff)
            })
            .await;

        assert_eq!(result, Err(CapabilityError::BluetoothOff));
        assert_eq!(calls, 1);
    }
}
