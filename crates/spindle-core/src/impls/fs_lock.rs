//! FsLockManager - `<root>/locks/<id>.lock` による claim
//!
//! claim は一時ファイルを no-clobber rename で置くだけ。既に存在すれば
//! rename が失敗するので、競合した 2 プロセスのどちらか一方だけが勝つ。
//! release は保持者の一致を確認してから消すため `store.lock` の下で行う。

use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::fs_store::STORE_LOCK;
use super::fs_util::{blocking, ensure_dir, list_files, lock_file, read_json, write_new};
use crate::domain::{CoreError, HolderId, TaskId};
use crate::ports::{Clock, Lock, LockManager, SystemClock};

#[derive(Clone)]
pub struct FsLockManager {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FsLockManager {
    pub fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let root = root.into();
        ensure_dir(&root.join("locks"))?;
        Ok(Self { root, clock })
    }

    pub fn open_default(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        Self::open(root, Arc::new(SystemClock))
    }

    fn lock_path(&self, task_id: &TaskId) -> PathBuf {
        lock_path(&self.root, task_id)
    }
}

fn lock_path(root: &Path, task_id: &TaskId) -> PathBuf {
    root.join("locks").join(format!("{task_id}.lock"))
}

#[async_trait]
impl LockManager for FsLockManager {
    async fn try_claim(&self, task_id: &TaskId, holder: &HolderId) -> Result<bool, CoreError> {
        let lock = Lock {
            task_id: task_id.clone(),
            holder: holder.clone(),
            acquired_at: self.clock.now(),
        };
        let path = self.lock_path(task_id);
        blocking("claim", move || {
            let won = write_new(&path, &lock)?;
            debug!(task_id = %lock.task_id, holder = %lock.holder, won, "claim attempt");
            Ok(won)
        })
        .await
    }

    async fn release(&self, task_id: &TaskId, holder: &HolderId) -> Result<bool, CoreError> {
        let path = self.lock_path(task_id);
        let guard_path = self.root.join(STORE_LOCK);
        let holder = holder.clone();
        blocking("release", move || {
            let _guard = lock_file(&guard_path)?;
            match read_json::<Lock>(&path)? {
                Some(lock) if lock.holder == holder => match fs::remove_file(&path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(CoreError::backend(format!("remove {}", path.display()), e)),
                },
                _ => Ok(false),
            }
        })
        .await
    }

    async fn holder(&self, task_id: &TaskId) -> Result<Option<Lock>, CoreError> {
        let path = self.lock_path(task_id);
        blocking("read lock", move || read_json::<Lock>(&path)).await
    }

    async fn live_locks(&self) -> Result<Vec<Lock>, CoreError> {
        let dir = self.root.join("locks");
        blocking("list locks", move || {
            let mut locks = Vec::new();
            for path in list_files(&dir, "lock")? {
                // released between listing and reading
                if let Some(lock) = read_json::<Lock>(&path)? {
                    locks.push(lock);
                }
            }
            Ok(locks)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunId;
    use tempfile::TempDir;
    use ulid::Ulid;

    fn holder(name: &str, pid: u32) -> HolderId {
        HolderId::new(name, pid, None, RunId::from_ulid(Ulid::new()))
    }

    #[tokio::test]
    async fn racing_claims_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let locks = Arc::new(FsLockManager::open_default(dir.path()).unwrap());
        let id = TaskId::parse("T001").unwrap();

        let mut handles = Vec::new();
        for n in 0..16 {
            let locks = locks.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                locks.try_claim(&id, &holder(&format!("w{n}"), n)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(locks.live_locks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_requires_matching_holder() {
        let dir = TempDir::new().unwrap();
        let locks = FsLockManager::open_default(dir.path()).unwrap();
        let id = TaskId::parse("T001").unwrap();
        let a = holder("a", 10);
        let b = holder("b", 11);

        assert!(locks.try_claim(&id, &a).await.unwrap());
        assert!(!locks.release(&id, &b).await.unwrap());
        assert_eq!(locks.holder(&id).await.unwrap().unwrap().holder, a);

        assert!(locks.release(&id, &a).await.unwrap());
        assert!(locks.holder(&id).await.unwrap().is_none());
        assert!(!locks.release(&id, &a).await.unwrap());
    }
}
