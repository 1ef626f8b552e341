//! Retry ceiling and escalation thresholds.

use serde::{Deserialize, Serialize};

/// How many failures a task may accumulate, and how many identical gate
/// rejections in a row send it to human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// 0 disables escalation.
    pub escalate_after: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, escalate_after: u32) -> Self {
        Self {
            max_retries,
            escalate_after,
        }
    }

    /// True when a task that has used `attempts_used` failures may go back to PENDING.
    pub fn allows_retry(&self, attempts_used: u32) -> bool {
        attempts_used < self.max_retries
    }

    pub fn should_escalate(&self, consecutive_rejections: u32) -> bool {
        self.escalate_after > 0 && consecutive_rejections >= self.escalate_after
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_counts_failures_including_current() {
        let p = RetryPolicy::new(3, 0);
        assert!(p.allows_retry(1));
        assert!(p.allows_retry(2));
        assert!(!p.allows_retry(3));
    }

    #[test]
    fn zero_disables_escalation() {
        assert!(!RetryPolicy::new(3, 0).should_escalate(10));
        assert!(RetryPolicy::new(3, 2).should_escalate(2));
        assert!(!RetryPolicy::new(3, 2).should_escalate(1));
    }
}
