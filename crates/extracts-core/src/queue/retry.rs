//! Retry decisions and backoff delays.

use std::time::Duration;

use crate::domain::{Backoff, Job};

impl Backoff {
    /// Delay before redelivering after the failure of attempt `attempt` (0-indexed).
    ///
    /// `initial_delay * 2^attempt`, capped at `max_delay`:
    /// with 10s initial, attempt 0 waits 10s, attempt 1 waits 20s, attempt 2 waits 40s.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What the queue does with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Exhausted,
}

/// Decide based on the attempts made before this failure.
pub fn decide(job: &Job) -> RetryDecision {
    if job.has_retries_left() {
        RetryDecision::Retry {
            delay: job.backoff.next_delay(job.attempts_made),
        }
    } else {
        RetryDecision::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(0, 10)]
    #[case::second(1, 20)]
    #[case::third(2, 40)]
    #[case::capped(10, 600)]
    #[case::overflow(64, 600)]
    fn exponential_with_cap(#[case] attempt: u32, #[case] secs: u64) {
        let backoff = Backoff::exponential(Duration::from_secs(10), Duration::from_secs(600));
        assert_eq!(backoff.next_delay(attempt), Duration::from_secs(secs));
    }
}
