//! WorkerLoop - claim → execute → verify → finalize
//!
//! # 1 ステップの流れ
//! 1. PENDING を優先度順に並べ、先頭から TryClaim（負けたら次の候補へ）
//! 2. claim 後に読み直し、まだ PENDING か確認
//! 3. RateLimiter.acquire（拒否なら状態を変えずに lock を返して Deferred）
//! 4. PENDING → IN_PROGRESS
//! 5. Executor を deadline 付きで実行
//! 6. QualityGate で検証し、COMPLETE / リトライ経路 / DECOMPOSED へ
//! 7. 状態遷移を記録した後でだけ lock を release する
//!    （記録に失敗しても、backend 障害でなければ lock は必ず返す）
//!
//! ワーカー同士はメモリ上の状態を共有しない。協調は TaskStore / LockManager のみ。

use rand::Rng;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::builder::Orchestrator;
use super::chainer::{ChainOutcome, QueueChainer};
use super::finalize::record_failure;
use crate::domain::fractal::plan_children;
use crate::domain::{
    AttemptId, CoreError, ExecutorError, FailureKind, HolderId, Outcome, OutcomeKind, QueueName,
    Task, TaskId, TaskStatus, Transition,
};
use crate::gate::Verdict;
use crate::ports::Admission;

/// Result of one pass of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStep {
    /// No claimable task.
    Idle,
    /// A task was executed and left in `status`.
    Processed { task: TaskId, status: TaskStatus },
    /// The call budget is spent; the task stays PENDING.
    Deferred { task: TaskId, retry_after: Duration },
}

pub struct WorkerLoop {
    ctx: Orchestrator,
    queue: QueueName,
    holder: HolderId,
    actor: String,
}

impl WorkerLoop {
    pub fn new(ctx: Orchestrator, queue: QueueName, holder: HolderId) -> Self {
        let actor = holder.to_string();
        Self {
            ctx,
            queue,
            holder,
            actor,
        }
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    /// Runs until shutdown is signalled or a fatal backend error occurs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        let poll = self.ctx.config.poll_interval();
        let max_idle = self.ctx.config.max_idle();
        let mut idle = poll;

        info!(worker = %self.holder, queue = %self.queue, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.step().await {
                Ok(WorkerStep::Processed { .. }) => {
                    idle = poll;
                    continue;
                }
                Ok(WorkerStep::Idle) => {
                    let pause = jittered(idle);
                    idle = (idle * 2).min(max_idle);
                    pause
                }
                Ok(WorkerStep::Deferred { retry_after, .. }) => retry_after.min(max_idle),
                Err(e) if e.is_fatal() => {
                    error!(worker = %self.holder, error = %e, "backend unavailable, worker stopping");
                    return Err(e);
                }
                Err(e) => {
                    warn!(worker = %self.holder, error = %e, "worker step failed");
                    poll
                }
            };
            if sleep_or_shutdown(&mut shutdown, pause).await {
                break;
            }
        }
        info!(worker = %self.holder, "worker stopped");
        Ok(())
    }

    /// One claim attempt over the current PENDING set.
    pub async fn step(&self) -> Result<WorkerStep, CoreError> {
        let mut candidates = self
            .ctx
            .store
            .list_pending(self.queue)
            .await?
            .collect::<Result<Vec<Task>, CoreError>>()?;
        candidates.sort_by(by_priority);

        for candidate in candidates {
            if !self.ctx.locks.try_claim(&candidate.id, &self.holder).await? {
                debug!(task_id = %candidate.id, "claim conflict, trying next");
                continue;
            }

            let task = match self.ctx.store.read(&candidate.id).await {
                Ok(task) if task.status == TaskStatus::Pending => task,
                Ok(_) => {
                    self.release(&candidate.id).await?;
                    continue;
                }
                Err(e) => {
                    self.release(&candidate.id).await?;
                    return Err(e);
                }
            };

            match self.ctx.rate_limiter.acquire().await {
                Ok(Admission::Allowed) => {}
                Ok(Admission::Denied { retry_after }) => {
                    self.release(&task.id).await?;
                    info!(task_id = %task.id, ?retry_after, "rate limited, deferring");
                    return Ok(WorkerStep::Deferred {
                        task: task.id,
                        retry_after,
                    });
                }
                Err(e) => {
                    self.release(&task.id).await?;
                    return Err(e);
                }
            }

            return self.process(task).await;
        }
        Ok(WorkerStep::Idle)
    }

    async fn process(&self, task: Task) -> Result<WorkerStep, CoreError> {
        let attempt = self.ctx.ids.generate_attempt_id();
        let claim = Transition::new(TaskStatus::Pending, TaskStatus::InProgress, &self.actor)
            .with_attempt(attempt)
            .with_detail(format!("claimed by {}", self.holder));
        let task = match self.ctx.store.transition(&task.id, claim).await {
            Ok(task) => task,
            Err(e) if !e.is_fatal() => {
                warn!(task_id = %task.id, error = %e, "lost task before start");
                self.release(&task.id).await?;
                return Ok(WorkerStep::Idle);
            }
            Err(e) => return Err(e),
        };
        info!(task_id = %task.id, %attempt, "executing");

        let deadline = Instant::now() + self.ctx.config.agent_timeout();
        let run = tokio::time::timeout_at(deadline, self.ctx.executor.run(&task, deadline)).await;
        let outcome = match run {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(ExecutorError::RateLimited { name, retry_after })) => {
                return self.defer(task, attempt, &name, retry_after).await;
            }
            Ok(Err(e)) => Outcome::failure(e.to_string()),
            Err(_) => Outcome::timeout(format!(
                "no result within {}s",
                self.ctx.config.agent_timeout_secs
            )),
        };

        let settled = self.settle(&task, attempt, outcome).await;
        let settled = self.release_after(&task.id, settled).await?;
        info!(task_id = %task.id, status = %settled.status, "attempt finished");
        Ok(WorkerStep::Processed {
            task: task.id,
            status: settled.status,
        })
    }

    /// The executor itself is out of budget: hand the task back untouched.
    async fn defer(
        &self,
        task: Task,
        attempt: AttemptId,
        executor: &str,
        retry_after: Option<Duration>,
    ) -> Result<WorkerStep, CoreError> {
        let back = Transition::new(TaskStatus::InProgress, TaskStatus::Pending, &self.actor)
            .with_attempt(attempt)
            .with_detail(format!("executor {executor} rate limited; deferred"));
        let back = self.ctx.store.transition(&task.id, back).await;
        self.release_after(&task.id, back).await?;
        Ok(WorkerStep::Deferred {
            task: task.id,
            retry_after: retry_after.unwrap_or_else(|| self.ctx.config.poll_interval()),
        })
    }

    async fn settle(&self, task: &Task, attempt: AttemptId, outcome: Outcome) -> Result<Task, CoreError> {
        match outcome.kind {
            OutcomeKind::Success => self.verify_and_complete(task, attempt, &outcome).await,
            OutcomeKind::Failure => {
                let detail = outcome.reason.unwrap_or_else(|| "executor reported failure".into());
                self.fail(task, attempt, FailureKind::AgentFailure, detail).await
            }
            OutcomeKind::Timeout => {
                let detail = outcome.reason.unwrap_or_else(|| "executor timed out".into());
                self.fail(task, attempt, FailureKind::AgentTimeout, detail).await
            }
            OutcomeKind::Decomposed => self.decompose(task, attempt, &outcome).await,
        }
    }

    async fn verify_and_complete(
        &self,
        task: &Task,
        attempt: AttemptId,
        outcome: &Outcome,
    ) -> Result<Task, CoreError> {
        let detail = match self.ctx.gate.verify(task.queue, outcome) {
            Verdict::Clean => "verified clean".to_string(),
            Verdict::CleanWithWarnings(issues) => {
                let rules: Vec<&str> = issues.iter().map(|i| i.rule.as_str()).collect();
                format!("verified with {} warning(s): {}", issues.len(), rules.join(", "))
            }
            Verdict::Rejected(rejection) => {
                warn!(
                    task_id = %task.id,
                    rule = rejection.primary_rule(),
                    score = rejection.score,
                    "quality gate rejected claimed success"
                );
                let failure = FailureKind::QualityGateRejection {
                    rule: rejection.primary_rule().to_string(),
                };
                return self.fail(task, attempt, failure, rejection.feedback).await;
            }
        };

        let complete = Transition::new(TaskStatus::InProgress, TaskStatus::Complete, &self.actor)
            .with_attempt(attempt)
            .with_detail(detail)
            .with_artifacts(outcome.changed_paths());
        let completed = self.ctx.store.transition(&task.id, complete).await?;

        let chainer = QueueChainer::new(self.ctx.store.clone(), self.ctx.clock.clone());
        match chainer.chain(&completed).await {
            Ok(ChainOutcome::Skipped(reason)) => debug!(task_id = %task.id, reason, "not chained"),
            Ok(_) => {}
            // the reconciler's chaining sweep picks it up later
            Err(e) if !e.is_fatal() => warn!(task_id = %task.id, error = %e, "chaining failed"),
            Err(e) => return Err(e),
        }
        Ok(completed)
    }

    async fn decompose(
        &self,
        task: &Task,
        attempt: AttemptId,
        outcome: &Outcome,
    ) -> Result<Task, CoreError> {
        let children = match plan_children(
            task,
            &outcome.child_tasks,
            self.ctx.config.max_decompose_depth,
            &self.actor,
            self.ctx.clock.now(),
        ) {
            Ok(children) => children,
            Err(e) => {
                return self
                    .fail(task, attempt, FailureKind::AgentFailure, e.to_string())
                    .await;
            }
        };

        let mut ids = Vec::with_capacity(children.len());
        for child in children {
            let id = child.id.clone();
            match self.ctx.store.create(child).await {
                Ok(()) => {}
                // left behind by an attempt that crashed before recording DECOMPOSED
                Err(CoreError::Duplicate(_)) => debug!(task_id = %id, "child already exists"),
                Err(e) => return Err(e),
            }
            ids.push(id);
        }

        info!(task_id = %task.id, children = ids.len(), "decomposed");
        let decomposed = Transition::new(TaskStatus::InProgress, TaskStatus::Decomposed, &self.actor)
            .with_attempt(attempt)
            .with_detail(format!("split into {} children", ids.len()))
            .with_children(ids);
        self.ctx.store.transition(&task.id, decomposed).await
    }

    async fn fail(
        &self,
        task: &Task,
        attempt: AttemptId,
        failure: FailureKind,
        detail: String,
    ) -> Result<Task, CoreError> {
        record_failure(&self.ctx, task, failure, detail, &self.actor, Some(attempt)).await
    }

    /// Releases the claim on `id` whatever `result` holds, except when the
    /// backend itself is gone; that lock is left for the reaper.
    async fn release_after<T>(&self, id: &TaskId, result: Result<T, CoreError>) -> Result<T, CoreError> {
        match result {
            Err(e) if e.is_fatal() => Err(e),
            result => {
                if let Err(e) = &result {
                    warn!(task_id = %id, error = %e, "attempt ended without recording a result");
                }
                self.release(id).await?;
                result
            }
        }
    }

    async fn release(&self, id: &TaskId) -> Result<(), CoreError> {
        if !self.ctx.locks.release(id, &self.holder).await? {
            warn!(task_id = %id, holder = %self.holder, "lock was not ours to release");
        }
        Ok(())
    }
}

/// Highest priority first; ties broken by age, then id.
fn by_priority(a: &Task, b: &Task) -> Ordering {
    b.priority
        .total_cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Up to +10% so idle workers do not poll in lockstep.
fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64) / 10;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Sleeps for `pause` unless shutdown arrives first. Returns true on shutdown.
pub(crate) async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(pause) => false,
    }
}
