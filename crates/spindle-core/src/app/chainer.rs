//! QueueChainer - 上流キューの検証済み完了から下流タスクを生成する
//!
//! 冪等: 既に連鎖済みなら provenance 検索で見つかるので二重生成しない。
//! 生成は "create if not exists" なので、同時に走っても片方が Duplicate になり、
//! その後の provenance 再検索で既存タスクを返す。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::domain::{CoreError, Provenance, QueueName, Task, TaskId, TaskStatus};
use crate::ports::{Clock, TaskStore};

const MAX_ALLOCATION_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Spawned(TaskId),
    AlreadyChained(TaskId),
    Skipped(&'static str),
}

pub struct QueueChainer {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl QueueChainer {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn chain(&self, source: &Task) -> Result<ChainOutcome, CoreError> {
        if source.status != TaskStatus::Complete {
            return Ok(ChainOutcome::Skipped("source not complete"));
        }
        let Some(downstream) = source.queue.downstream() else {
            return Ok(ChainOutcome::Skipped("no downstream queue"));
        };
        if source.parent.is_some() {
            return Ok(ChainOutcome::Skipped("child task; the parent chains"));
        }
        if source.artifacts.is_empty() {
            return Ok(ChainOutcome::Skipped("no observable side effects"));
        }
        if let Some(existing) = self.store.find_by_provenance(&source.id).await? {
            return Ok(ChainOutcome::AlreadyChained(existing.id));
        }

        let mut candidate = match (source.id.queue(), source.id.sequence()) {
            (Some(q), Some(_)) if q == source.queue => source.id.counterpart(downstream),
            _ => next_free_id(self.store.as_ref(), downstream).await?,
        };

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let task = downstream_task(source, candidate.clone(), downstream, self.clock.now());
            match self.store.create(task).await {
                Ok(()) => {
                    info!(
                        source = %source.id,
                        task_id = %candidate,
                        queue = %downstream,
                        "chained downstream task"
                    );
                    return Ok(ChainOutcome::Spawned(candidate));
                }
                Err(CoreError::Duplicate(_)) => {
                    if let Some(existing) = self.store.find_by_provenance(&source.id).await? {
                        return Ok(ChainOutcome::AlreadyChained(existing.id));
                    }
                    candidate = next_free_id(self.store.as_ref(), downstream).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::Duplicate(format!(
            "no free id in {downstream} after {MAX_ALLOCATION_ATTEMPTS} attempts"
        )))
    }
}

fn downstream_task(source: &Task, id: TaskId, queue: QueueName, now: DateTime<Utc>) -> Task {
    let payload = serde_json::json!({
        "source": source.id,
        "artifacts": source.artifacts,
        "payload": source.payload,
    });
    Task::new(id, queue, payload, "chainer", now)
        .with_priority(source.priority)
        .with_provenance(Provenance {
            source: source.id.clone(),
            artifacts: source.artifacts.clone(),
        })
}

/// One past the highest numbered id in `queue` (`T001` if empty).
pub async fn next_free_id(store: &dyn TaskStore, queue: QueueName) -> Result<TaskId, CoreError> {
    let highest = store
        .list(queue)
        .await?
        .iter()
        .filter_map(|t| t.id.sequence())
        .max()
        .unwrap_or(0);
    Ok(TaskId::numbered(queue, highest + 1))
}
