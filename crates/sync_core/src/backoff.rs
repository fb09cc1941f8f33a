use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failures tolerated before automatic retries stop.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// `base * 2^attempt`, capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted { attempts: u32 },
}

/// Consecutive-failure counter driving the reconnect schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn record_failure(&mut self) -> RetryDecision {
        if self.attempt >= self.policy.max_attempts {
            return RetryDecision::Exhausted {
                attempts: self.attempt + 1,
            };
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        RetryDecision::RetryAfter(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
