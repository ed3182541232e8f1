//! Retry policy: decides backoff delays between attempts.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and a little jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// `retried` is the number of failed attempts before the one that just
    /// failed: `base_delay * 2^retried`, capped at `max_delay`.
    pub fn backoff(&self, retried: u32) -> Duration {
        let factor = 2u32.saturating_pow(retried.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff plus up to 10% random jitter so retries of a burst spread out.
    pub fn next_delay(&self, retried: u32) -> Duration {
        let delay = self.backoff(retried);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60));

        assert_eq!(policy.backoff(10), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_millis(4400));
        }
    }

    #[test]
    fn test_zero_base_delay() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(policy.next_delay(3), Duration::ZERO);
    }
}
