//! TaskStore port - タスク記録の正本（source of truth）
//!
//! - 生成は "create if not exists"（重複は `CoreError::Duplicate`）
//! - 状態遷移は compare-and-swap（`Transition::from` が保存値と一致しなければ失敗）
//! - 削除はしない。タスクは最終状態に落ち着くだけ

use async_trait::async_trait;

use crate::domain::{CoreError, QueueName, Task, TaskId, TaskStatus, Transition};

/// Lazily evaluated snapshot of a queue. Records that changed after the
/// snapshot was taken are read at their current version when reached.
pub type TaskSnapshot = Box<dyn Iterator<Item = Result<Task, CoreError>> + Send>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new record. Fails with `Duplicate` if the id exists.
    async fn create(&self, task: Task) -> Result<(), CoreError>;

    async fn read(&self, id: &TaskId) -> Result<Task, CoreError>;

    /// PENDING tasks of `queue`. Does not block writers.
    async fn list_pending(&self, queue: QueueName) -> Result<TaskSnapshot, CoreError>;

    /// Every task of `queue`, in id order.
    async fn list(&self, queue: QueueName) -> Result<Vec<Task>, CoreError>;

    /// Applies `transition` atomically and returns the updated record.
    async fn transition(&self, id: &TaskId, transition: Transition) -> Result<Task, CoreError>;

    /// The task chained from `source`, if one exists.
    async fn find_by_provenance(&self, source: &TaskId) -> Result<Option<Task>, CoreError>;
}

/// Tasks of `queue` currently in `status`.
pub async fn list_with_status(
    store: &dyn TaskStore,
    queue: QueueName,
    status: TaskStatus,
) -> Result<Vec<Task>, CoreError> {
    Ok(store
        .list(queue)
        .await?
        .into_iter()
        .filter(|t| t.status == status)
        .collect())
}
