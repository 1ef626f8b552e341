//! WorkerPool - 1 キュー分のワーカー群 + reaper + reconciler
//!
//! # Graceful shutdown
//! - watch チャネルで全ループに停止を通知
//! - 各ループは実行中のタスクを終えてから抜ける
//! - どれか 1 つが致命的エラー（BackendUnavailable）で止まったら全体も止める
//! - panic したループも同様に全体を止める

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::builder::Orchestrator;
use super::reaper_loop::StaleLockReaper;
use super::reconcile_loop::Reconciler;
use super::worker_loop::WorkerLoop;
use crate::domain::{CoreError, QueueName};
use crate::impls::current_holder;

/// Cloneable handle that stops a running pool.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct WorkerPool {
    shutdown: ShutdownTrigger,
    loops: JoinSet<Result<(), CoreError>>,
}

impl WorkerPool {
    /// Starts `concurrency` workers on `queue` plus one reaper and one
    /// reconciler, all sharing `ctx`.
    pub fn spawn(ctx: Orchestrator, queue: QueueName, concurrency: usize) -> Self {
        let (tx, rx) = watch::channel(false);
        let shutdown = ShutdownTrigger { tx: Arc::new(tx) };
        let run = ctx.ids.generate_run_id();
        let mut loops = JoinSet::new();

        for n in 1..=concurrency.max(1) {
            let holder = current_holder(format!("{queue}-worker-{n}"), run);
            let worker = WorkerLoop::new(ctx.clone(), queue, holder);
            let rx = rx.clone();
            let trigger = shutdown.clone();
            loops.spawn(async move { stop_all_on_fatal(worker.run(rx).await, &trigger) });
        }

        let reaper = StaleLockReaper::new(ctx.clone(), current_holder("reaper", run));
        let (reaper_rx, trigger) = (rx.clone(), shutdown.clone());
        loops.spawn(async move { stop_all_on_fatal(reaper.run(reaper_rx).await, &trigger) });

        let reconciler = Reconciler::new(ctx, current_holder("reconciler", run));
        let trigger = shutdown.clone();
        loops.spawn(async move { stop_all_on_fatal(reconciler.run(rx).await, &trigger) });

        info!(%queue, concurrency, %run, "worker pool started");
        Self { shutdown, loops }
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Waits for every loop to exit. Returns the first error any loop hit.
    pub async fn join(mut self) -> Result<(), CoreError> {
        let mut first = None;
        while let Some(joined) = self.loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first.get_or_insert(e);
                }
                Err(join) => {
                    error!(error = %join, "pool loop panicked; stopping the rest");
                    self.shutdown.fire();
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn shutdown_and_join(self) -> Result<(), CoreError> {
        self.shutdown.fire();
        self.join().await
    }
}

fn stop_all_on_fatal(result: Result<(), CoreError>, trigger: &ShutdownTrigger) -> Result<(), CoreError> {
    if result.is_err() {
        trigger.fire();
    }
    result
}
