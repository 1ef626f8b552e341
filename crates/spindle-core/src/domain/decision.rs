//! Decision model: what happens to a task after a failed attempt.
//!
//! Deciders are pure: given the task as stored (before the current failure is
//! recorded) and the failure, they return the next action. Applying it is the
//! worker's job.

use super::retry::RetryPolicy;
use super::state::TaskStatus;
use super::task::{FailureKind, Task};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Record FAILED, then put the task back to PENDING.
    Retry { reason: String },

    /// Retry budget exhausted; pin at FAILED.
    MarkFailed { reason: String },

    /// Repeated identical gate rejections; BLOCKED for human review.
    Escalate { reason: String },
}

impl Decision {
    /// Status the task is left in once the decision is applied.
    pub fn resting_status(&self) -> TaskStatus {
        match self {
            Decision::Retry { .. } => TaskStatus::Pending,
            Decision::MarkFailed { .. } => TaskStatus::Failed,
            Decision::Escalate { .. } => TaskStatus::Blocked,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Decision::Retry { reason }
            | Decision::MarkFailed { reason }
            | Decision::Escalate { reason } => reason,
        }
    }
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, failure: &FailureKind) -> Decision;
}

/// Retry-ceiling decider with escalation of repeated gate rejections.
///
/// The ceiling is checked first: a task out of budget is FAILED even if it
/// would also qualify for escalation.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, failure: &FailureKind) -> Decision {
        let used = task.attempts_used() + 1;
        if !self.policy.allows_retry(used) {
            return Decision::MarkFailed {
                reason: format!("max retries reached: {}/{}", used, self.policy.max_retries),
            };
        }

        if let FailureKind::QualityGateRejection { rule } = failure {
            let streak = task.consecutive_rejections(rule) + 1;
            if self.policy.should_escalate(streak) {
                return Decision::Escalate {
                    reason: format!("rejected by `{rule}` {streak} times in a row"),
                };
            }
        }

        Decision::Retry {
            reason: format!("retry {}/{}", used, self.policy.max_retries),
        }
    }
}
