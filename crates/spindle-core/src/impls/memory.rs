//! In-memory TaskStore / LockManager - 単一プロセス・テスト用
//!
//! tokio Mutex 1 つで排他するので、CAS も claim もロック内で完結する。
//! 永続化しないため、プロセスを跨いだクラッシュ回復の検証にはファイル実装を使う。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::{CoreError, HolderId, QueueName, Task, TaskId, TaskStatus, Transition};
use crate::ports::{Clock, Lock, LockManager, SystemClock, TaskSnapshot, TaskStore};

pub struct InMemoryTaskStore {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            clock,
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: Task) -> Result<(), CoreError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Err(CoreError::Duplicate(task.id.to_string()));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn read(&self, id: &TaskId) -> Result<Task, CoreError> {
        self.tasks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    async fn list_pending(&self, queue: QueueName) -> Result<TaskSnapshot, CoreError> {
        let pending: Vec<Task> = self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.queue == queue && t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        Ok(Box::new(pending.into_iter().map(Ok)))
    }

    async fn list(&self, queue: QueueName) -> Result<Vec<Task>, CoreError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.queue == queue)
            .cloned()
            .collect())
    }

    async fn transition(&self, id: &TaskId, transition: Transition) -> Result<Task, CoreError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        task.apply(&transition, self.clock.now())?;
        Ok(task.clone())
    }

    async fn find_by_provenance(&self, source: &TaskId) -> Result<Option<Task>, CoreError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .find(|t| t.provenance.as_ref().is_some_and(|p| &p.source == source))
            .cloned())
    }
}

pub struct InMemoryLockManager {
    locks: Mutex<HashMap<TaskId, Lock>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_claim(&self, task_id: &TaskId, holder: &HolderId) -> Result<bool, CoreError> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(task_id) {
            return Ok(false);
        }
        locks.insert(
            task_id.clone(),
            Lock {
                task_id: task_id.clone(),
                holder: holder.clone(),
                acquired_at: self.clock.now(),
            },
        );
        Ok(true)
    }

    async fn release(&self, task_id: &TaskId, holder: &HolderId) -> Result<bool, CoreError> {
        let mut locks = self.locks.lock().await;
        match locks.get(task_id) {
            Some(lock) if &lock.holder == holder => {
                locks.remove(task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, task_id: &TaskId) -> Result<Option<Lock>, CoreError> {
        Ok(self.locks.lock().await.get(task_id).cloned())
    }

    async fn live_locks(&self) -> Result<Vec<Lock>, CoreError> {
        let mut locks: Vec<Lock> = self.locks.lock().await.values().cloned().collect();
        locks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(locks)
    }
}
