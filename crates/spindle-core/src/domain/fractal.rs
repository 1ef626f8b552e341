//! Fractal decomposition: parent/child planning and settlement.
//!
//! A DECOMPOSED parent is never driven by a call stack. Children are ordinary
//! tasks; the reconciler polls them and settles the parent from their status.

use chrono::{DateTime, Utc};

use super::ids::TaskId;
use super::outcome::ChildSpec;
use super::retry::RetryPolicy;
use super::state::TaskStatus;
use super::task::Task;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecomposeError {
    #[error("decomposition produced no children")]
    Empty,

    #[error("decomposition depth {depth} exceeds limit {max}")]
    TooDeep { depth: u32, max: u32 },
}

/// Builds the child records for `parent`. Numbering continues after any
/// children the parent already has, so a retried parent never collides.
pub fn plan_children(
    parent: &Task,
    specs: &[ChildSpec],
    max_depth: u32,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, DecomposeError> {
    if specs.is_empty() {
        return Err(DecomposeError::Empty);
    }
    let depth = parent.depth + 1;
    if depth > max_depth {
        return Err(DecomposeError::TooDeep {
            depth,
            max: max_depth,
        });
    }

    let offset = parent.children.len();
    Ok(specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            Task::new(
                parent.id.child(offset + i + 1),
                parent.queue,
                spec.payload.clone(),
                actor,
                now,
            )
            .with_priority(spec.priority.unwrap_or(parent.priority))
            .with_parent(parent.id.clone(), depth)
        })
        .collect())
}

/// Where a DECOMPOSED parent stands given its children.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Some child can still make progress.
    Open,

    /// Every child completed. Carries the union of their artifacts.
    Complete { artifacts: Vec<String> },

    /// Every child settled, but not all completed.
    Partial { unfinished: Vec<TaskId> },
}

/// A child is settled once no worker will touch it again without an
/// operator: COMPLETE, FAILED with its budget spent, or BLOCKED.
pub fn child_settled(child: &Task, policy: &RetryPolicy, locked: bool) -> bool {
    if locked {
        return false;
    }
    match child.status {
        TaskStatus::Complete | TaskStatus::Blocked => true,
        TaskStatus::Failed => !policy.allows_retry(child.attempts_used()),
        _ => false,
    }
}

/// `children` pairs each child record with whether it is currently locked.
pub fn settle(children: &[(Task, bool)], policy: &RetryPolicy) -> Settlement {
    if children.is_empty()
        || !children
            .iter()
            .all(|(child, locked)| child_settled(child, policy, *locked))
    {
        return Settlement::Open;
    }

    let unfinished: Vec<TaskId> = children
        .iter()
        .filter(|(child, _)| child.status != TaskStatus::Complete)
        .map(|(child, _)| child.id.clone())
        .collect();
    if !unfinished.is_empty() {
        return Settlement::Partial { unfinished };
    }

    let mut artifacts = Vec::new();
    for (child, _) in children {
        for path in &child.artifacts {
            if !artifacts.contains(path) {
                artifacts.push(path.clone());
            }
        }
    }
    Settlement::Complete { artifacts }
}
