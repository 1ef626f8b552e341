//! Reconciler - DECOMPOSED 親の集約と、取りこぼした連鎖の補完
//!
//! # 親の集約
//! - 全子が COMPLETE → 親を COMPLETE（子の artifacts の和集合）して連鎖
//! - 全子が確定したが一部未完了 → FRACTAL_PARTIAL として失敗経路へ
//! - 進行中の子がいる間は何もしない
//!
//! # 連鎖の補完
//! COMPLETE 直後にプロセスが落ちると下流タスクが作られない。
//! provenance で未連鎖のものを見つけて chain() し直す（chain は冪等）。

use std::collections::HashSet;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::builder::Orchestrator;
use super::chainer::{ChainOutcome, QueueChainer};
use super::finalize::record_failure;
use super::worker_loop::sleep_or_shutdown;
use crate::domain::fractal::settle;
use crate::domain::{
    CoreError, FailureKind, HolderId, QueueName, Settlement, Task, TaskId, TaskStatus, Transition,
};
use crate::ports::list_with_status;

const ACTOR: &str = "reconciler";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub chained: Vec<TaskId>,
}

pub struct Reconciler {
    ctx: Orchestrator,
    holder: HolderId,
    chainer: QueueChainer,
}

impl Reconciler {
    pub fn new(ctx: Orchestrator, holder: HolderId) -> Self {
        let chainer = QueueChainer::new(ctx.store.clone(), ctx.clock.clone());
        Self {
            ctx,
            holder,
            chainer,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        let interval = self.ctx.config.reconcile_interval();
        loop {
            match self.reconcile_once().await {
                Ok(report) => {
                    if !report.completed.is_empty() || !report.failed.is_empty() {
                        info!(
                            completed = report.completed.len(),
                            failed = report.failed.len(),
                            "settled decomposed parents"
                        );
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "reconciler stopping");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "reconcile sweep failed"),
            }
            if sleep_or_shutdown(&mut shutdown, interval).await {
                return Ok(());
            }
        }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileReport, CoreError> {
        let mut report = ReconcileReport::default();
        for queue in QueueName::ALL {
            for parent in list_with_status(self.ctx.store.as_ref(), queue, TaskStatus::Decomposed).await? {
                self.settle_parent(parent, &mut report).await?;
            }
        }
        self.sweep_unchained(&mut report).await?;
        Ok(report)
    }

    async fn settle_parent(&self, parent: Task, report: &mut ReconcileReport) -> Result<(), CoreError> {
        let mut children = Vec::with_capacity(parent.active_children.len());
        for id in &parent.active_children {
            let child = self.ctx.store.read(id).await?;
            let locked = self.ctx.locks.holder(id).await?.is_some();
            children.push((child, locked));
        }

        let settlement = settle(&children, &self.ctx.config.retry_policy());
        if settlement == Settlement::Open {
            return Ok(());
        }

        if !self.ctx.locks.try_claim(&parent.id, &self.holder).await? {
            debug!(task_id = %parent.id, "parent locked, skipping");
            return Ok(());
        }
        let result = self.apply(&parent.id, settlement, report).await;
        self.ctx.locks.release(&parent.id, &self.holder).await?;
        result
    }

    async fn apply(
        &self,
        id: &TaskId,
        settlement: Settlement,
        report: &mut ReconcileReport,
    ) -> Result<(), CoreError> {
        let parent = self.ctx.store.read(id).await?;
        if parent.status != TaskStatus::Decomposed {
            return Ok(());
        }
        match settlement {
            Settlement::Open => {}
            Settlement::Complete { artifacts } => {
                let done = Transition::new(TaskStatus::Decomposed, TaskStatus::Complete, ACTOR)
                    .with_detail(format!("all {} children complete", parent.active_children.len()))
                    .with_artifacts(artifacts);
                let completed = self.ctx.store.transition(id, done).await?;
                info!(task_id = %id, "decomposed parent complete");
                report.completed.push(id.clone());
                if let ChainOutcome::Spawned(next) = self.chainer.chain(&completed).await? {
                    report.chained.push(next);
                }
            }
            Settlement::Partial { unfinished } => {
                let names: Vec<&str> = unfinished.iter().map(TaskId::as_str).collect();
                let detail = format!("children did not complete: {}", names.join(", "));
                record_failure(&self.ctx, &parent, FailureKind::FractalPartial, detail, ACTOR, None)
                    .await?;
                report.failed.push(id.clone());
            }
        }
        Ok(())
    }

    async fn sweep_unchained(&self, report: &mut ReconcileReport) -> Result<(), CoreError> {
        for queue in QueueName::ALL {
            let Some(downstream) = queue.downstream() else {
                continue;
            };
            let chained: HashSet<TaskId> = self
                .ctx
                .store
                .list(downstream)
                .await?
                .into_iter()
                .filter_map(|t| t.provenance.map(|p| p.source))
                .collect();

            for task in list_with_status(self.ctx.store.as_ref(), queue, TaskStatus::Complete).await? {
                if task.parent.is_some() || task.artifacts.is_empty() || chained.contains(&task.id) {
                    continue;
                }
                if let ChainOutcome::Spawned(next) = self.chainer.chain(&task).await? {
                    info!(source = %task.id, task_id = %next, "recovered missing chain");
                    report.chained.push(next);
                }
            }
        }
        Ok(())
    }
}
