//! Failure path shared by the worker (IN_PROGRESS) and the reconciler
//! (DECOMPOSED parents whose children did not all complete).

use tracing::{info, warn};

use super::builder::Orchestrator;
use crate::domain::{AttemptId, CoreError, Decision, FailureKind, Task, TaskStatus, Transition};

/// Records `failure` against `task` (currently in `task.status`) and applies
/// the decider's verdict. Returns the task as it was left.
pub(crate) async fn record_failure(
    ctx: &Orchestrator,
    task: &Task,
    failure: FailureKind,
    detail: String,
    actor: &str,
    attempt: Option<AttemptId>,
) -> Result<Task, CoreError> {
    let from = task.status;
    let decision = ctx.decider.decide(task, &failure);

    let target = match decision {
        Decision::Escalate { .. } if from.can_transition_to(TaskStatus::Blocked) => {
            TaskStatus::Blocked
        }
        _ => TaskStatus::Failed,
    };
    let mut failed = Transition::new(from, target, actor)
        .with_failure(failure.clone())
        .with_detail(detail);
    if let Some(attempt) = attempt {
        failed = failed.with_attempt(attempt);
    }
    let recorded = ctx.store.transition(&task.id, failed).await?;

    match decision {
        Decision::Escalate { reason } if target == TaskStatus::Blocked => {
            warn!(task_id = %task.id, reason = %reason, "escalated for human review");
            Ok(recorded)
        }
        Decision::MarkFailed { reason } => {
            warn!(task_id = %task.id, reason = %reason, "task failed permanently");
            Ok(recorded)
        }
        Decision::Retry { reason } | Decision::Escalate { reason } => {
            info!(task_id = %task.id, ?failure, retry_count = recorded.retry_count, "retrying");
            let retry = Transition::new(TaskStatus::Failed, TaskStatus::Pending, actor)
                .with_detail(reason);
            ctx.store.transition(&task.id, retry).await
        }
    }
}
