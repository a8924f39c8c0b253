//! Fixed-delay retry policy for gateway calls
//!
//! Every retry waits the same delay; there is no exponential growth and no
//! jitter, so the spacing between attempts is exactly `delay`.

use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of tries, the first one included
    pub max_attempts: usize,
    /// Delay between consecutive tries
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy. At least one try is always made.
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// Retry state tracker
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: usize,
}

impl RetryState {
    /// Create a new retry state
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Check if another try is allowed
    pub fn should_retry(&self) -> bool {
        self.attempt < self.policy.max_attempts
    }

    /// Record a failed attempt
    pub fn record_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Delay before the next try
    pub fn next_delay(&self) -> Duration {
        self.policy.delay
    }

    /// Number of tries made so far
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Get remaining attempts
    pub fn remaining_attempts(&self) -> usize {
        self.policy.max_attempts.saturating_sub(self.attempt)
    }
}
