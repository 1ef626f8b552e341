//! FsTaskStore - ファイルシステム上の TaskStore
//!
//! ```text
//! <root>/tasks/<QUEUE>/<id>.json   タスク記録
//! <root>/store.lock                状態遷移の CAS を直列化する排他ロック
//! ```
//!
//! 複数のワーカープロセスが同じ root を共有する。プロセス間の協調は
//! rename の原子性と `store.lock` の排他ロックだけで行う。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::fs_util::{blocking, ensure_dir, list_files, lock_file, read_json, write_new, write_replace};
use crate::domain::{CoreError, QueueName, Task, TaskId, TaskStatus, Transition};
use crate::ports::{Clock, SystemClock, TaskSnapshot, TaskStore};

pub const STORE_LOCK: &str = "store.lock";

#[derive(Clone)]
pub struct FsTaskStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FsTaskStore {
    /// Opens (creating if needed) the task directories under `root`.
    pub fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let root = root.into();
        for queue in QueueName::ALL {
            ensure_dir(&queue_dir(&root, queue))?;
        }
        Ok(Self { root, clock })
    }

    pub fn open_default(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        Self::open(root, Arc::new(SystemClock))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Queues to search for `id`, the one its prefix names first.
    fn candidate_paths(&self, id: &TaskId) -> Vec<PathBuf> {
        let mut queues: Vec<QueueName> = id.queue().into_iter().collect();
        queues.extend(QueueName::ALL.into_iter().filter(|q| Some(*q) != id.queue()));
        queues
            .into_iter()
            .map(|q| task_path(&self.root, q, id))
            .collect()
    }
}

fn queue_dir(root: &Path, queue: QueueName) -> PathBuf {
    root.join("tasks").join(queue.as_str())
}

fn task_path(root: &Path, queue: QueueName, id: &TaskId) -> PathBuf {
    queue_dir(root, queue).join(format!("{id}.json"))
}

fn locate(paths: &[PathBuf], id: &TaskId) -> Result<(PathBuf, Task), CoreError> {
    for path in paths {
        if let Some(task) = read_json::<Task>(path)? {
            return Ok((path.clone(), task));
        }
    }
    Err(CoreError::NotFound(id.to_string()))
}

fn read_queue(root: &Path, queue: QueueName) -> Result<Vec<Task>, CoreError> {
    let mut tasks = Vec::new();
    for path in list_files(&queue_dir(root, queue), "json")? {
        if let Some(task) = read_json::<Task>(&path)? {
            tasks.push(task);
        }
    }
    Ok(tasks)
}

#[async_trait]
impl TaskStore for FsTaskStore {
    async fn create(&self, task: Task) -> Result<(), CoreError> {
        let path = task_path(&self.root, task.queue, &task.id);
        blocking("create task", move || {
            if write_new(&path, &task)? {
                debug!(task_id = %task.id, queue = %task.queue, "task created");
                Ok(())
            } else {
                Err(CoreError::Duplicate(task.id.to_string()))
            }
        })
        .await
    }

    async fn read(&self, id: &TaskId) -> Result<Task, CoreError> {
        let paths = self.candidate_paths(id);
        let id = id.clone();
        blocking("read task", move || locate(&paths, &id).map(|(_, task)| task)).await
    }

    async fn list_pending(&self, queue: QueueName) -> Result<TaskSnapshot, CoreError> {
        let dir = queue_dir(&self.root, queue);
        let paths = blocking("list pending", move || list_files(&dir, "json")).await?;

        // Each record is read when the iterator reaches it; a task claimed
        // after the listing simply filters out.
        let iter = paths.into_iter().filter_map(|path| match read_json::<Task>(&path) {
            Ok(Some(task)) if task.status == TaskStatus::Pending => Some(Ok(task)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        });
        Ok(Box::new(iter))
    }

    async fn list(&self, queue: QueueName) -> Result<Vec<Task>, CoreError> {
        let root = self.root.clone();
        blocking("list tasks", move || read_queue(&root, queue)).await
    }

    async fn transition(&self, id: &TaskId, transition: Transition) -> Result<Task, CoreError> {
        let paths = self.candidate_paths(id);
        let guard_path = self.root.join(STORE_LOCK);
        let clock = self.clock.clone();
        let id = id.clone();
        blocking("transition task", move || {
            let _guard = lock_file(&guard_path)?;
            let (path, mut task) = locate(&paths, &id)?;
            task.apply(&transition, clock.now())?;
            write_replace(&path, &task)?;
            debug!(
                task_id = %id,
                from = %transition.from,
                to = %transition.to,
                actor = %transition.actor,
                "task transitioned"
            );
            Ok(task)
        })
        .await
    }

    async fn find_by_provenance(&self, source: &TaskId) -> Result<Option<Task>, CoreError> {
        let root = self.root.clone();
        let source = source.clone();
        blocking("find by provenance", move || {
            for queue in QueueName::ALL {
                if let Some(task) = read_queue(&root, queue)?
                    .into_iter()
                    .find(|t| t.provenance.as_ref().is_some_and(|p| p.source == source))
                {
                    return Ok(Some(task));
                }
            }
            Ok(None)
        })
        .await
    }
}
