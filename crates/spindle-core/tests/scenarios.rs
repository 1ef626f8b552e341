//! End-to-end scenarios against the file-system backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use ulid::Ulid;

use spindle_core::app::{
    AppBuilder, ChainOutcome, Orchestrator, QueueChainer, Reconciler, StaleLockReaper, WorkerLoop,
    WorkerPool, WorkerStep, admin, status,
};
use spindle_core::config::OrchestratorConfig;
use spindle_core::domain::{
    ChildSpec, ExecutorError, FailureKind, HolderId, Outcome, QueueName, RunId, Task, TaskId,
    TaskStatus, Transition,
};
use spindle_core::impls::{FsLockManager, FsTaskStore, current_holder};
use spindle_core::ports::{Clock, Executor, LivenessProbe, SystemClock, TaskStore};

type Script = dyn Fn(&Task) -> Result<Outcome, ExecutorError> + Send + Sync;

/// Executor whose result is computed from the task; counts calls per task.
struct Scripted {
    script: Box<Script>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Duration,
}

impl Scripted {
    fn new(script: impl Fn(&Task) -> Result<Outcome, ExecutorError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
        })
    }

    fn slow(
        delay: Duration,
        script: impl Fn(&Task) -> Result<Outcome, ExecutorError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(HashMap::new()),
            delay,
        })
    }

    fn calls(&self) -> HashMap<String, usize> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, task: &Task, _deadline: Instant) -> Result<Outcome, ExecutorError> {
        *self.calls.lock().unwrap().entry(task.id.to_string()).or_default() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(task)
    }
}

/// On its first run, has an operator block and reset the task underneath the
/// worker before reporting success; later runs just succeed.
#[derive(Default)]
struct ResetMidRun {
    store: OnceLock<Arc<dyn TaskStore>>,
    meddled: AtomicBool,
}

#[async_trait]
impl Executor for ResetMidRun {
    fn name(&self) -> &str {
        "reset-mid-run"
    }

    async fn run(&self, task: &Task, _deadline: Instant) -> Result<Outcome, ExecutorError> {
        if !self.meddled.swap(true, Ordering::SeqCst) {
            let store = self.store.get().expect("store not wired");
            store
                .transition(&task.id, Transition::new(TaskStatus::InProgress, TaskStatus::Blocked, "operator"))
                .await
                .unwrap();
            admin::reset(store.as_ref(), &task.id, "operator").await.unwrap();
        }
        Ok(verified_change())
    }
}

/// Liveness decided by worker name.
struct DeadWorkers(Vec<&'static str>);

impl LivenessProbe for DeadWorkers {
    fn is_alive(&self, holder: &HolderId) -> bool {
        !self.0.contains(&holder.worker.as_str())
    }
}

fn verified_change() -> Outcome {
    Outcome::success()
        .with_file_change("src/calc.rs", "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n")
        .with_verification("cargo test", 0)
}

fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        poll_interval_ms: 10,
        max_idle_ms: 40,
        reaper_interval_secs: 1,
        reconcile_interval_secs: 1,
        ..OrchestratorConfig::default()
    };
    config.rate_limit.calls = 0;
    config
}

struct Harness {
    _dir: TempDir,
    ctx: Orchestrator,
}

impl Harness {
    fn new(config: OrchestratorConfig, executor: Arc<dyn Executor>) -> Self {
        Self::with_probe(config, executor, Arc::new(DeadWorkers(Vec::new())))
    }

    fn with_probe(config: OrchestratorConfig, executor: Arc<dyn Executor>, probe: Arc<dyn LivenessProbe>) -> Self {
        let dir = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ctx = AppBuilder::new(config)
            .store(Arc::new(FsTaskStore::open(dir.path(), clock.clone()).unwrap()))
            .locks(Arc::new(FsLockManager::open(dir.path(), clock.clone()).unwrap()))
            .executor(executor)
            .liveness(probe)
            .clock(clock)
            .build()
            .unwrap();
        Self { _dir: dir, ctx }
    }

    async fn enqueue(&self, queue: QueueName) -> TaskId {
        admin::enqueue(self.ctx.store(), self.ctx.clock(), queue, None, 0.0, serde_json::json!({"story": "add"}))
            .await
            .unwrap()
            .id
    }

    fn worker(&self, name: &str, queue: QueueName) -> WorkerLoop {
        WorkerLoop::new(self.ctx.clone(), queue, holder(name))
    }

    async fn read(&self, id: &str) -> Task {
        self.ctx.store().read(&TaskId::parse(id).unwrap()).await.unwrap()
    }
}

fn holder(name: &str) -> HolderId {
    current_holder(name, RunId::from_ulid(Ulid::new()))
}

#[tokio::test]
async fn verified_success_completes_and_chains_to_deploy() {
    let h = Harness::new(fast_config(), Scripted::new(|_| Ok(verified_change())));
    let id = h.enqueue(QueueName::Tdd).await;
    assert_eq!(id.as_str(), "T001");

    let step = h.worker("w1", QueueName::Tdd).step().await.unwrap();
    assert_eq!(
        step,
        WorkerStep::Processed {
            task: id.clone(),
            status: TaskStatus::Complete
        }
    );

    let done = h.read("T001").await;
    assert_eq!(done.artifacts, vec!["src/calc.rs".to_string()]);
    assert_eq!(done.retry_count, 0);
    assert!(h.ctx.locks().holder(&id).await.unwrap().is_none());

    let deploy = h.read("D001").await;
    assert_eq!(deploy.status, TaskStatus::Pending);
    assert_eq!(deploy.provenance.unwrap().source, id);
    assert_eq!(deploy.payload["artifacts"][0], "src/calc.rs");
}

#[tokio::test]
async fn deploy_tasks_pass_without_file_changes() {
    let h = Harness::new(
        fast_config(),
        Scripted::new(|_| Ok(Outcome::success().with_verification("./deploy.sh --check", 0))),
    );
    let id = h.enqueue(QueueName::Deploy).await;

    let step = h.worker("w1", QueueName::Deploy).step().await.unwrap();
    assert_eq!(
        step,
        WorkerStep::Processed {
            task: id,
            status: TaskStatus::Complete
        }
    );
}

#[tokio::test]
async fn stubbed_success_is_rejected_and_retried() {
    let h = Harness::new(
        fast_config(),
        Scripted::new(|_| {
            Ok(Outcome::success()
                .with_file_change("src/calc.rs", "pub fn add(a: i32, b: i32) -> i32 {\n    todo!()\n}\n")
                .with_verification("cargo test", 0))
        }),
    );
    h.enqueue(QueueName::Tdd).await;

    let step = h.worker("w1", QueueName::Tdd).step().await.unwrap();
    assert!(matches!(step, WorkerStep::Processed { status: TaskStatus::Pending, .. }));

    let task = h.read("T001").await;
    assert_eq!(task.retry_count, 1);
    assert!(task.last_error.as_deref().unwrap_or_default().contains("MUST FIX"));
    let statuses: Vec<TaskStatus> = task.history.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Failed,
            TaskStatus::Pending
        ]
    );
    assert_eq!(
        task.history[2].failure,
        Some(FailureKind::QualityGateRejection {
            rule: "todo-macro".into()
        })
    );
    assert!(h.ctx.store().list(QueueName::Deploy).await.unwrap().is_empty());
}

#[tokio::test]
async fn same_rejection_twice_escalates_to_blocked() {
    let h = Harness::new(
        fast_config(),
        Scripted::new(|_| Ok(Outcome::success().with_file_change("src/calc.rs", "fn add() {}\n"))),
    );
    h.enqueue(QueueName::Tdd).await;
    let worker = h.worker("w1", QueueName::Tdd);

    worker.step().await.unwrap();
    assert_eq!(h.read("T001").await.status, TaskStatus::Pending);
    worker.step().await.unwrap();

    let task = h.read("T001").await;
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(worker.step().await.unwrap(), WorkerStep::Idle);

    let reset = admin::reset(h.ctx.store().as_ref(), &task.id, "operator").await.unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert_eq!(reset.attempts_used(), 0);
}

#[tokio::test]
async fn exhausted_retries_leave_task_failed() {
    let h = Harness::new(fast_config(), Scripted::new(|_| Ok(Outcome::failure("tests still red"))));
    h.enqueue(QueueName::Tdd).await;
    let worker = h.worker("w1", QueueName::Tdd);

    for _ in 0..3 {
        assert!(matches!(worker.step().await.unwrap(), WorkerStep::Processed { .. }));
    }
    let task = h.read("T001").await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert_eq!(task.last_error.as_deref(), Some("tests still red"));

    assert_eq!(worker.step().await.unwrap(), WorkerStep::Idle);
    assert_eq!(status::count(h.ctx.store().as_ref(), QueueName::Tdd).await.unwrap().failed, 1);
}

#[tokio::test]
async fn crashed_worker_is_reaped_and_task_runs_elsewhere() {
    let executor = Scripted::new(|_| Ok(verified_change()));
    let h = Harness::with_probe(fast_config(), executor.clone(), Arc::new(DeadWorkers(vec!["crashed"])));
    let id = h.enqueue(QueueName::Tdd).await;

    // simulate a worker that claimed and died mid-execution
    let crashed = HolderId::new("crashed", 999_999, Some(1), RunId::from_ulid(Ulid::new()));
    assert!(h.ctx.locks().try_claim(&id, &crashed).await.unwrap());
    h.ctx
        .store()
        .transition(&id, Transition::new(TaskStatus::Pending, TaskStatus::InProgress, "crashed@999999"))
        .await
        .unwrap();

    // nobody else can take it while the lock stands
    assert_eq!(h.worker("b", QueueName::Tdd).step().await.unwrap(), WorkerStep::Idle);

    let report = StaleLockReaper::new(h.ctx.clone(), holder("reaper")).reap_once().await.unwrap();
    assert_eq!(report.requeued, vec![id.clone()]);
    let task = h.read("T001").await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);

    let step = h.worker("b", QueueName::Tdd).step().await.unwrap();
    assert!(matches!(step, WorkerStep::Processed { status: TaskStatus::Complete, .. }));
    assert_eq!(executor.calls()["T001"], 1);
}

#[tokio::test]
async fn chaining_is_idempotent_across_retries_and_sweeps() {
    let h = Harness::new(fast_config(), Scripted::new(|_| Ok(verified_change())));
    h.enqueue(QueueName::Tdd).await;
    h.worker("w1", QueueName::Tdd).step().await.unwrap();

    let source = h.read("T001").await;
    let chainer = QueueChainer::new(h.ctx.store().clone(), h.ctx.clock().clone());
    assert_eq!(
        chainer.chain(&source).await.unwrap(),
        ChainOutcome::AlreadyChained(TaskId::parse("D001").unwrap())
    );
    let report = Reconciler::new(h.ctx.clone(), holder("reconciler"))
        .reconcile_once()
        .await
        .unwrap();
    assert!(report.chained.is_empty());
    assert_eq!(h.ctx.store().list(QueueName::Deploy).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limited_claim_defers_without_touching_the_task() {
    let mut config = fast_config();
    config.rate_limit.calls = 1;
    let h = Harness::new(config, Scripted::new(|_| Ok(verified_change())));
    h.enqueue(QueueName::Tdd).await;
    h.enqueue(QueueName::Tdd).await;
    let worker = h.worker("w1", QueueName::Tdd);

    assert!(matches!(worker.step().await.unwrap(), WorkerStep::Processed { .. }));
    let step = worker.step().await.unwrap();
    assert!(matches!(step, WorkerStep::Deferred { .. }));

    let task = h.read("T002").await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.history.len(), 1);
    assert!(h.ctx.locks().live_locks().await.unwrap().is_empty());
}

#[tokio::test]
async fn executor_rate_limit_hands_task_back() {
    let h = Harness::new(
        fast_config(),
        Scripted::new(|_| {
            Err(ExecutorError::RateLimited {
                name: "agent".into(),
                retry_after: Some(Duration::from_secs(30)),
            })
        }),
    );
    let id = h.enqueue(QueueName::Tdd).await;

    let step = h.worker("w1", QueueName::Tdd).step().await.unwrap();
    assert_eq!(
        step,
        WorkerStep::Deferred {
            task: id,
            retry_after: Duration::from_secs(30)
        }
    );
    let task = h.read("T001").await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
}

#[tokio::test]
async fn decomposed_task_completes_through_its_children() {
    let h = Harness::new(
        fast_config(),
        Scripted::new(|task| {
            if task.parent.is_none() {
                Ok(Outcome::decomposed(vec![
                    ChildSpec::new(serde_json::json!("parse input")),
                    ChildSpec::new(serde_json::json!("format output")),
                ]))
            } else {
                Ok(Outcome::success()
                    .with_file_change(format!("src/{}.rs", task.id), "pub fn part() {}\n")
                    .with_verification("cargo test", 0))
            }
        }),
    );
    h.enqueue(QueueName::Tdd).await;
    let worker = h.worker("w1", QueueName::Tdd);

    let step = worker.step().await.unwrap();
    assert!(matches!(step, WorkerStep::Processed { status: TaskStatus::Decomposed, .. }));
    let parent = h.read("T001").await;
    let children: Vec<&str> = parent.children.iter().map(TaskId::as_str).collect();
    assert_eq!(children, vec!["T001.1", "T001.2"]);
    assert_eq!(h.read("T001.1").await.depth, 1);

    for _ in 0..2 {
        assert!(matches!(
            worker.step().await.unwrap(),
            WorkerStep::Processed { status: TaskStatus::Complete, .. }
        ));
    }
    // children do not chain on their own
    assert!(h.ctx.store().list(QueueName::Deploy).await.unwrap().is_empty());

    let report = Reconciler::new(h.ctx.clone(), holder("reconciler"))
        .reconcile_once()
        .await
        .unwrap();
    assert_eq!(report.completed, vec![TaskId::parse("T001").unwrap()]);

    let parent = h.read("T001").await;
    assert_eq!(parent.status, TaskStatus::Complete);
    assert_eq!(parent.artifacts.len(), 2);
    assert_eq!(h.read("D001").await.provenance.unwrap().source.as_str(), "T001");
}

#[tokio::test]
async fn retried_parent_settles_on_its_latest_children() {
    let h = Harness::new(
        fast_config(),
        Scripted::new(|task| {
            if task.parent.is_none() {
                let specs = if task.children.is_empty() {
                    vec![
                        ChildSpec::new(serde_json::json!("parse input")),
                        ChildSpec::new(serde_json::json!("format output")),
                    ]
                } else {
                    vec![ChildSpec::new(serde_json::json!("format output, smaller"))]
                };
                Ok(Outcome::decomposed(specs))
            } else if task.id.as_str() == "T001.2" {
                Ok(Outcome::failure("formatter keeps crashing"))
            } else {
                Ok(Outcome::success()
                    .with_file_change(format!("src/{}.rs", task.id), "pub fn part() {}\n")
                    .with_verification("cargo test", 0))
            }
        }),
    );
    h.enqueue(QueueName::Tdd).await;
    let worker = h.worker("w1", QueueName::Tdd);
    let reconciler = Reconciler::new(h.ctx.clone(), holder("reconciler"));

    // first generation: T001.2 burns through its retries
    while worker.step().await.unwrap() != WorkerStep::Idle {}
    assert_eq!(h.read("T001.2").await.status, TaskStatus::Failed);
    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.failed, vec![TaskId::parse("T001").unwrap()]);
    let parent = h.read("T001").await;
    assert_eq!(parent.status, TaskStatus::Pending);
    assert_eq!(parent.retry_count, 1);

    // second generation replaces the settle set
    while worker.step().await.unwrap() != WorkerStep::Idle {}
    let parent = h.read("T001").await;
    let all: Vec<&str> = parent.children.iter().map(TaskId::as_str).collect();
    let active: Vec<&str> = parent.active_children.iter().map(TaskId::as_str).collect();
    assert_eq!(all, vec!["T001.1", "T001.2", "T001.3"]);
    assert_eq!(active, vec!["T001.3"]);

    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.completed, vec![TaskId::parse("T001").unwrap()]);
    assert_eq!(report.chained, vec![TaskId::parse("D001").unwrap()]);
    let parent = h.read("T001").await;
    assert_eq!(parent.status, TaskStatus::Complete);
    assert_eq!(parent.artifacts, vec!["src/T001.3.rs".to_string()]);
}

#[tokio::test]
async fn slow_executor_times_out_and_is_retried() {
    let mut config = fast_config();
    config.agent_timeout_secs = 1;
    let executor = Scripted::slow(Duration::from_secs(3), |_| Ok(verified_change()));
    let h = Harness::new(config, executor.clone());
    let id = h.enqueue(QueueName::Tdd).await;

    let started = Instant::now();
    let step = h.worker("w1", QueueName::Tdd).step().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3), "deadline was not enforced");
    assert_eq!(
        step,
        WorkerStep::Processed {
            task: id.clone(),
            status: TaskStatus::Pending
        }
    );

    let task = h.read("T001").await;
    assert_eq!(task.retry_count, 1);
    assert!(task.history.iter().any(|e| e.failure == Some(FailureKind::AgentTimeout)));
    assert!(task.last_error.as_deref().unwrap_or_default().contains("1s"));
    assert!(h.ctx.locks().holder(&id).await.unwrap().is_none());
    assert!(h.ctx.locks().live_locks().await.unwrap().is_empty());
    assert_eq!(executor.calls()["T001"], 1);
}

#[tokio::test]
async fn task_reset_during_execution_releases_the_claim() {
    let executor = Arc::new(ResetMidRun::default());
    let h = Harness::new(fast_config(), executor.clone());
    let _ = executor.store.set(h.ctx.store().clone());
    let id = h.enqueue(QueueName::Tdd).await;

    // the task is no longer IN_PROGRESS when the worker tries to complete it
    let err = h.worker("w1", QueueName::Tdd).step().await.unwrap_err();
    assert!(!err.is_fatal());
    assert!(h.ctx.locks().holder(&id).await.unwrap().is_none());
    assert_eq!(h.read("T001").await.status, TaskStatus::Pending);

    let step = h.worker("w2", QueueName::Tdd).step().await.unwrap();
    assert_eq!(
        step,
        WorkerStep::Processed {
            task: id,
            status: TaskStatus::Complete
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_executes_every_task_exactly_once() {
    let executor = Scripted::slow(Duration::from_millis(20), |_| Ok(verified_change()));
    let h = Harness::new(fast_config(), executor.clone());
    for _ in 0..12 {
        h.enqueue(QueueName::Tdd).await;
    }

    let pool = WorkerPool::spawn(h.ctx.clone(), QueueName::Tdd, 4);
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let counts = status::count(h.ctx.store().as_ref(), QueueName::Tdd).await.unwrap();
        if counts.complete == 12 {
            break;
        }
        assert!(Instant::now() < deadline, "pool did not drain: {counts:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    pool.shutdown_and_join().await.unwrap();

    let calls = executor.calls();
    assert_eq!(calls.len(), 12);
    assert!(calls.values().all(|&n| n == 1), "duplicate execution: {calls:?}");
    assert_eq!(h.ctx.store().list(QueueName::Deploy).await.unwrap().len(), 12);
    assert!(h.ctx.locks().live_locks().await.unwrap().is_empty());
}
