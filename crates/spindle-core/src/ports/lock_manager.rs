//! LockManager port - タスク単位の排他 claim
//!
//! Lock の存在そのものが「誰かが処理中」のシグナル。
//! claim はブロックしない。失敗したら別タスクを探すだけ。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CoreError, HolderId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub task_id: TaskId,
    pub holder: HolderId,
    pub acquired_at: DateTime<Utc>,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Creates the lock iff none exists. The creation is one indivisible
    /// operation, so of two racing holders exactly one gets `true`.
    async fn try_claim(&self, task_id: &TaskId, holder: &HolderId) -> Result<bool, CoreError>;

    /// Removes the lock only if `holder` owns it. Returns whether it did.
    async fn release(&self, task_id: &TaskId, holder: &HolderId) -> Result<bool, CoreError>;

    async fn holder(&self, task_id: &TaskId) -> Result<Option<Lock>, CoreError>;

    /// Every lock currently on record, live holder or not.
    async fn live_locks(&self) -> Result<Vec<Lock>, CoreError>;
}
