//! Status - キュー状態の集計
//!
//! `spindle status` の中身。読み取りのみで lock は取らないので、
//! 集計中に他のワーカーが進めた分はずれることがある。

use serde::Serialize;

use crate::domain::{CoreError, QueueName, TaskStatus};
use crate::ports::{Lock, LockManager, RateLimitStats, RateLimiter, TaskStore};

/// Per-status task counts for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queue: QueueName,
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
    pub blocked: usize,
    pub decomposed: usize,
    pub total: usize,
}

impl QueueCounts {
    pub fn empty(queue: QueueName) -> Self {
        Self {
            queue,
            pending: 0,
            in_progress: 0,
            complete: 0,
            failed: 0,
            blocked: 0,
            decomposed: 0,
            total: 0,
        }
    }

    fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Complete => &mut self.complete,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Blocked => &mut self.blocked,
            TaskStatus::Decomposed => &mut self.decomposed,
        };
        *slot += 1;
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Complete => self.complete,
            TaskStatus::Failed => self.failed,
            TaskStatus::Blocked => self.blocked,
            TaskStatus::Decomposed => self.decomposed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub queues: Vec<QueueCounts>,
    pub live_locks: Vec<Lock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitStats>,
}

impl StatusReport {
    pub fn queue(&self, queue: QueueName) -> Option<&QueueCounts> {
        self.queues.iter().find(|c| c.queue == queue)
    }
}

pub async fn count(store: &dyn TaskStore, queue: QueueName) -> Result<QueueCounts, CoreError> {
    let mut counts = QueueCounts::empty(queue);
    for task in store.list(queue).await? {
        counts.record(task.status);
    }
    Ok(counts)
}

pub async fn report(
    store: &dyn TaskStore,
    locks: &dyn LockManager,
    rate_limiter: Option<&dyn RateLimiter>,
) -> Result<StatusReport, CoreError> {
    let mut queues = Vec::with_capacity(QueueName::ALL.len());
    for queue in QueueName::ALL {
        queues.push(count(store, queue).await?);
    }
    let rate_limit = match rate_limiter {
        Some(limiter) => Some(limiter.stats().await?),
        None => None,
    };
    Ok(StatusReport {
        queues,
        live_locks: locks.live_locks().await?,
        rate_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Task, TaskId, Transition};
    use crate::impls::{InMemoryLockManager, InMemoryTaskStore};
    use chrono::Utc;

    #[tokio::test]
    async fn counts_every_status() {
        let store = InMemoryTaskStore::default();
        for id in ["T001", "T002", "T003"] {
            store
                .create(Task::new(TaskId::parse(id).unwrap(), QueueName::Tdd, serde_json::Value::Null, "t", Utc::now()))
                .await
                .unwrap();
        }
        store
            .transition(
                &TaskId::parse("T002").unwrap(),
                Transition::new(TaskStatus::Pending, TaskStatus::InProgress, "w"),
            )
            .await
            .unwrap();

        let report = report(&store, &InMemoryLockManager::default(), None).await.unwrap();
        let tdd = report.queue(QueueName::Tdd).unwrap();
        assert_eq!(tdd.total, 3);
        assert_eq!(tdd.get(TaskStatus::Pending), 2);
        assert_eq!(tdd.in_progress, 1);
        assert_eq!(report.queue(QueueName::Deploy).unwrap().total, 0);
        assert!(report.rate_limit.is_none());
    }
}
