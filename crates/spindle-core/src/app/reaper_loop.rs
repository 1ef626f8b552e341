//! StaleLockReaper - 死んだワーカーの lock と IN_PROGRESS タスクの回収
//!
//! # フロー
//! 1. live_locks() を走査し、holder が死んでいれば
//!    IN_PROGRESS → PENDING（retry_count は増やさない）→ lock release
//! 2. lock の無い IN_PROGRESS（orphan）は自分で claim してから PENDING に戻す
//!
//! 生死判定は LivenessProbe に任せる。pid 再利用は start_ticks で見分ける。

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::builder::Orchestrator;
use super::worker_loop::sleep_or_shutdown;
use crate::domain::{CoreError, HolderId, QueueName, TaskId, TaskStatus, Transition};
use crate::ports::{Lock, list_with_status};

const ACTOR: &str = "reaper";

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Tasks moved back to PENDING.
    pub requeued: Vec<TaskId>,
    /// Stale lock files removed.
    pub released: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.released == 0
    }
}

pub struct StaleLockReaper {
    ctx: Orchestrator,
    holder: HolderId,
}

impl StaleLockReaper {
    pub fn new(ctx: Orchestrator, holder: HolderId) -> Self {
        Self { ctx, holder }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        let interval = self.ctx.config.reaper_interval();
        loop {
            match self.reap_once().await {
                Ok(report) if !report.is_empty() => {
                    info!(requeued = report.requeued.len(), released = report.released, "reaped stale work");
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "reaper stopping");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "reaper sweep failed"),
            }
            if sleep_or_shutdown(&mut shutdown, interval).await {
                return Ok(());
            }
        }
    }

    pub async fn reap_once(&self) -> Result<ReapReport, CoreError> {
        let mut report = ReapReport::default();

        for lock in self.ctx.locks.live_locks().await? {
            if self.ctx.liveness.is_alive(&lock.holder) {
                continue;
            }
            self.reap_lock(&lock, &mut report).await?;
        }

        for queue in QueueName::ALL {
            for task in list_with_status(self.ctx.store.as_ref(), queue, TaskStatus::InProgress).await? {
                if self.ctx.locks.holder(&task.id).await?.is_some() {
                    continue;
                }
                self.reap_orphan(&task.id, &mut report).await?;
            }
        }
        Ok(report)
    }

    async fn reap_lock(&self, lock: &Lock, report: &mut ReapReport) -> Result<(), CoreError> {
        warn!(task_id = %lock.task_id, holder = %lock.holder, "lock holder is gone");
        match self.ctx.store.read(&lock.task_id).await {
            Ok(task) if task.status == TaskStatus::InProgress => {
                if self.requeue(&task.id, &lock.holder).await? {
                    report.requeued.push(task.id.clone());
                }
            }
            Ok(_) | Err(CoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if self.ctx.locks.release(&lock.task_id, &lock.holder).await? {
            report.released += 1;
        }
        Ok(())
    }

    async fn reap_orphan(&self, id: &TaskId, report: &mut ReapReport) -> Result<(), CoreError> {
        if !self.ctx.locks.try_claim(id, &self.holder).await? {
            // a worker claimed it in the meantime
            return Ok(());
        }
        let result = match self.ctx.store.read(id).await {
            Ok(task) if task.status == TaskStatus::InProgress => {
                warn!(task_id = %id, "in progress without a lock");
                self.requeue(id, &self.holder).await
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };
        self.ctx.locks.release(id, &self.holder).await?;
        if result? {
            report.requeued.push(id.clone());
        }
        Ok(())
    }

    async fn requeue(&self, id: &TaskId, stale: &HolderId) -> Result<bool, CoreError> {
        let back = Transition::new(TaskStatus::InProgress, TaskStatus::Pending, ACTOR)
            .with_detail(format!("reclaimed from {stale}"));
        match self.ctx.store.transition(id, back).await {
            Ok(_) => Ok(true),
            Err(CoreError::InvalidTransition { actual, .. }) => {
                debug!(task_id = %id, %actual, "already moved on");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
