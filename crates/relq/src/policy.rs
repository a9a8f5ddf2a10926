use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for message retries.
///
/// Determines how long a rolled-back message stays invisible before it can be received again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        /// Delay in seconds
        delay_seconds: u32,
    },
    /// Exponential backoff: delay = base * 2^attempt
    Exponential {
        /// Base delay in seconds
        base_seconds: u32,
        /// Maximum delay in seconds
        max_seconds: u32,
    },
    /// Exponential backoff with jitter (±25%)
    ExponentialWithJitter {
        /// Base delay in seconds
        base_seconds: u32,
        /// Maximum delay in seconds
        max_seconds: u32,
    },
}

/// Retry policy for failed messages.
///
/// ## What
///
/// - `max_retries`: how many failure rollbacks a message may go through. The failure that
///   would exceed this budget moves the message to the error store instead.
/// - `backoff`: delay strategy applied to `queue_process_time` on rollback when the queue has
///   delayed processing enabled.
///
/// ## How
///
/// ```rust
/// use relq::policy::{BackoffStrategy, RetryPolicy};
///
/// // Default: 3 retries with exponential backoff + jitter
/// let policy = RetryPolicy::default();
///
/// // Custom: 5 retries with a fixed 10-second delay
/// let policy = RetryPolicy {
///     max_retries: 5,
///     backoff: BackoffStrategy::Fixed { delay_seconds: 10 },
/// };
/// assert!(policy.should_retry(4));
/// assert!(!policy.should_retry(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::ExponentialWithJitter {
                base_seconds: 1,
                max_seconds: 60,
            },
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, as many times as needed.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Fixed { delay_seconds: 0 },
        }
    }

    /// Delay in seconds before the message becomes visible again.
    ///
    /// `attempt` is the retry count before this failure (0 = first failure).
    pub fn calculate_delay(&self, attempt: u32) -> u32 {
        match &self.backoff {
            BackoffStrategy::Fixed { delay_seconds } => *delay_seconds,
            BackoffStrategy::Exponential {
                base_seconds,
                max_seconds,
            } => base_seconds
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(*max_seconds),
            BackoffStrategy::ExponentialWithJitter {
                base_seconds,
                max_seconds,
            } => {
                let capped_delay = base_seconds
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(*max_seconds);

                let jitter_range = capped_delay / 4;
                if jitter_range == 0 {
                    return capped_delay;
                }

                let jitter_range = jitter_range.min(i32::MAX as u32) as i64;
                let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range) as i32;

                // never turn a configured non-zero delay into an immediate retry
                capped_delay.saturating_add_signed(jitter).max(1)
            }
        }
    }

    /// Same as [`calculate_delay`](Self::calculate_delay) but as a [`Duration`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.calculate_delay(attempt) as u64)
    }

    /// Whether a message that has already been retried `retry_count` times may be retried again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: BackoffStrategy::Fixed { delay_seconds: 7 },
        };
        assert_eq!(policy.calculate_delay(0), 7);
        assert_eq!(policy.calculate_delay(9), 7);
        assert_eq!(policy.delay_for(1), Duration::from_secs(7));
    }

    #[test]
    fn test_exponential_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff: BackoffStrategy::Exponential {
                base_seconds: 2,
                max_seconds: 30,
            },
        };
        assert_eq!(policy.calculate_delay(0), 2);
        assert_eq!(policy.calculate_delay(1), 4);
        assert_eq!(policy.calculate_delay(3), 16);
        assert_eq!(policy.calculate_delay(4), 30);
        assert_eq!(policy.calculate_delay(40), 30);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff: BackoffStrategy::ExponentialWithJitter {
                base_seconds: 8,
                max_seconds: 600,
            },
        };
        for _ in 0..200 {
            let delay = policy.calculate_delay(2);
            assert!((24..=40).contains(&delay), "delay {} out of range", delay);
        }
        // too small for jitter, but never zero
        let small = RetryPolicy::default();
        assert_eq!(small.calculate_delay(0), 1);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::immediate(1);
        assert!(policy.should_retry(0));
        assert!(!policy.should_retry(1));
        assert_eq!(policy.calculate_delay(5), 0);
        assert!(!RetryPolicy::immediate(0).should_retry(0));
    }
}
