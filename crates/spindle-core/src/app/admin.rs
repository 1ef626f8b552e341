//! Operator actions: enqueue new work and hand stuck tasks back to the pool.

use std::sync::Arc;
use tracing::info;

use super::chainer::next_free_id;
use crate::domain::{CoreError, QueueName, Task, TaskId, TaskStatus, Transition};
use crate::ports::{Clock, TaskStore};

const ALLOCATION_ATTEMPTS: usize = 16;

/// Creates a PENDING task. Without an explicit id the next free numbered id
/// of `queue` is taken.
pub async fn enqueue(
    store: &Arc<dyn TaskStore>,
    clock: &Arc<dyn Clock>,
    queue: QueueName,
    id: Option<TaskId>,
    priority: f64,
    payload: serde_json::Value,
) -> Result<Task, CoreError> {
    if let Some(id) = id {
        if id.queue() != Some(queue) {
            return Err(CoreError::InvalidId(format!(
                "{id} does not belong to queue {queue} (expected prefix {})",
                queue.prefix()
            )));
        }
        let task = Task::new(id, queue, payload, "operator", clock.now()).with_priority(priority);
        store.create(task.clone()).await?;
        info!(task_id = %task.id, %queue, "enqueued");
        return Ok(task);
    }

    for _ in 0..ALLOCATION_ATTEMPTS {
        let id = next_free_id(store.as_ref(), queue).await?;
        let task = Task::new(id, queue, payload.clone(), "operator", clock.now()).with_priority(priority);
        match store.create(task.clone()).await {
            Ok(()) => {
                info!(task_id = %task.id, %queue, "enqueued");
                return Ok(task);
            }
            Err(CoreError::Duplicate(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(CoreError::Duplicate(format!(
        "no free id in {queue} after {ALLOCATION_ATTEMPTS} attempts"
    )))
}

/// FAILED or BLOCKED → PENDING with a fresh retry budget.
pub async fn reset(store: &dyn TaskStore, id: &TaskId, actor: &str) -> Result<Task, CoreError> {
    let task = store.read(id).await?;
    if !matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
        return Err(CoreError::InvalidTransition {
            id: id.to_string(),
            expected: TaskStatus::Failed,
            actual: task.status,
        });
    }
    let reset = Transition::new(task.status, TaskStatus::Pending, actor)
        .with_detail("reset by operator")
        .as_reset();
    let task = store.transition(id, reset).await?;
    info!(task_id = %id, retry_count = task.retry_count, "reset");
    Ok(task)
}
