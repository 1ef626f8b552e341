//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task status.
///
/// State transitions:
/// - Pending -> InProgress -> Complete
/// - Pending -> InProgress -> Failed -> Pending (retry, while under the ceiling)
/// - Pending -> InProgress -> Blocked -> Pending (after human review)
/// - Pending -> InProgress -> Decomposed -> Complete | Failed (from children)
/// - InProgress -> Pending (stale lock reclaimed; not a failure)
///
/// Every path into a settled state passes through InProgress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Eligible for claiming.
    Pending,

    /// Claimed and being executed by the lock holder.
    InProgress,

    /// Verified success.
    Complete,

    /// Failed attempt; pinned here once the retry ceiling is reached.
    Failed,

    /// Escalated for human review.
    Blocked,

    /// Split into child tasks; settles from their outcomes.
    Decomposed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Complete,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::Decomposed,
    ];

    /// Allowed edges of the state graph.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (InProgress, Blocked)
                | (InProgress, Decomposed)
                | (InProgress, Pending)
                | (Failed, Pending)
                | (Blocked, Pending)
                | (Decomposed, Complete)
                | (Decomposed, Failed)
        )
    }

    /// No outgoing edges at all.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete)
    }

    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Decomposed => "DECOMPOSED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
