use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Exponential reconnect schedule: `min(2^attempts * base, max)`, at most
/// `max_attempts` retries between successful opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor)).min(self.max)
    }

    /// The delay is computed from the count before it is bumped, so the first
    /// retry waits exactly `base`.
    pub fn next(&self, attempts: &mut u32) -> RetryDecision {
        if *attempts >= self.max_attempts {
            return RetryDecision::Exhausted {
                attempts: *attempts,
            };
        }
        let delay = self.delay_for(*attempts);
        *attempts += 1;
        RetryDecision::Retry {
            attempt: *attempts,
            delay,
        }
    }
}
