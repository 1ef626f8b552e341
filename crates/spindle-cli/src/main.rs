//! spindle - ワーカー起動と運用コマンド
//!
//! 終了コード: 0 = 正常（シグナルによる停止を含む）、1 = 利用エラー、2 = backend 障害

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use spindle_core::app::{
    AppBuilder, Orchestrator, Reconciler, StaleLockReaper, WorkerLoop, WorkerPool, WorkerStep, admin, status,
};
use spindle_core::config::OrchestratorConfig;
use spindle_core::domain::{CoreError, QueueName, TaskId};
use spindle_core::impls::{
    CommandExecutor, ExecutorChain, FileRateLimiter, FsLockManager, FsTaskStore, SlidingWindow, current_holder,
};
use spindle_core::ports::{Clock, IdGenerator, RateLimiter, SystemClock, TaskStore, UlidGenerator};

#[derive(Parser)]
#[command(name = "spindle", about = "Multi-worker task orchestration over a shared directory")]
struct Cli {
    /// Shared state directory.
    #[arg(long, global = true, env = "SPINDLE_ROOT", default_value = ".spindle")]
    root: PathBuf,

    /// TOML config file; flags and environment override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true, env = "MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Seconds.
    #[arg(long, global = true, env = "AGENT_TIMEOUT")]
    agent_timeout: Option<u64>,

    /// Milliseconds.
    #[arg(long, global = true, env = "POLL_INTERVAL")]
    poll_interval: Option<u64>,

    /// Executor calls per window; 0 disables limiting.
    #[arg(long, global = true, env = "RATE_LIMIT")]
    rate_limit: Option<u32>,

    /// Seconds.
    #[arg(long, global = true, env = "REAPER_INTERVAL")]
    reaper_interval: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers plus the reaper and reconciler until interrupted.
    Work {
        #[arg(long)]
        queue: QueueName,
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Process a single task and exit instead of polling.
        #[arg(long)]
        once: bool,
        /// Shell command lines, in fallback order.
        #[arg(long = "executor", required = true)]
        executors: Vec<String>,
    },
    /// Add a PENDING task.
    Enqueue {
        #[arg(long)]
        queue: QueueName,
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        priority: f64,
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Print task counts as JSON.
    Status {
        #[arg(long)]
        queue: Option<QueueName>,
    },
    /// Move a FAILED or BLOCKED task back to PENDING with a fresh retry budget.
    Reset { id: String },
    /// One reaper pass followed by one reconcile pass.
    Reap,
}

impl Cli {
    fn load_config(&self) -> Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::load(path)?,
            None => OrchestratorConfig::default(),
        };
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.agent_timeout {
            config.agent_timeout_secs = v;
        }
        if let Some(v) = self.poll_interval {
            config.poll_interval_ms = v;
        }
        if let Some(v) = self.rate_limit {
            config.rate_limit.calls = v;
        }
        if let Some(v) = self.reaper_interval {
            config.reaper_interval_secs = v;
        }
        Ok(config)
    }
}

struct Backend {
    store: Arc<FsTaskStore>,
    locks: Arc<FsLockManager>,
    rate_limiter: Arc<FileRateLimiter>,
    clock: Arc<dyn Clock>,
}

impl Backend {
    fn open(root: &Path, config: &OrchestratorConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = FsTaskStore::open(root, clock.clone())
            .with_context(|| format!("open task store at {}", root.display()))?;
        let locks = FsLockManager::open(root, clock.clone())
            .with_context(|| format!("open lock directory at {}", root.display()))?;
        let window = SlidingWindow::new(
            config.rate_limit.calls,
            Duration::from_secs(config.rate_limit.window_secs),
        );
        let rate_limiter = FileRateLimiter::new(root, window, clock.clone());
        Ok(Self {
            store: Arc::new(store),
            locks: Arc::new(locks),
            rate_limiter: Arc::new(rate_limiter),
            clock,
        })
    }

    fn builder(&self, config: OrchestratorConfig) -> AppBuilder {
        AppBuilder::new(config)
            .store(self.store.clone())
            .locks(self.locks.clone())
            .rate_limiter(self.rate_limiter.clone())
            .clock(self.clock.clone())
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let fatal = e
                .chain()
                .filter_map(|cause| cause.downcast_ref::<CoreError>())
                .any(CoreError::is_fatal);
            error!("spindle failed: {e:#}");
            if fatal { ExitCode::from(2) } else { ExitCode::from(1) }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    let backend = Backend::open(&cli.root, &config)?;

    match cli.command {
        Command::Work {
            queue,
            concurrency,
            once,
            executors,
        } => {
            let mut builder = backend.builder(config);
            for line in executors {
                builder = builder.executor(Arc::new(CommandExecutor::shell(line)));
            }
            let ctx = builder.build()?;
            if once {
                run_once(ctx, queue).await.map(|_| ())
            } else {
                work(ctx, queue, concurrency).await
            }
        }
        Command::Enqueue {
            queue,
            id,
            priority,
            payload,
        } => {
            let id = id.map(TaskId::parse).transpose()?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let store: Arc<dyn TaskStore> = backend.store.clone();
            let task = admin::enqueue(&store, &backend.clock, queue, id, priority, payload).await?;
            println!("{}", task.id);
            Ok(())
        }
        Command::Status { queue } => {
            let rate_limiter: &dyn RateLimiter = backend.rate_limiter.as_ref();
            let mut report =
                status::report(backend.store.as_ref(), backend.locks.as_ref(), Some(rate_limiter)).await?;
            if let Some(queue) = queue {
                report.queues.retain(|c| c.queue == queue);
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Reset { id } => {
            let id = TaskId::parse(id)?;
            let task = admin::reset(backend.store.as_ref(), &id, "operator").await?;
            println!("{} {}", task.id, task.status);
            Ok(())
        }
        Command::Reap => {
            // maintenance passes never execute tasks
            let ctx = backend
                .builder(config)
                .executor(Arc::new(ExecutorChain::new(Vec::new())))
                .build()?;
            let run = UlidGenerator::new(backend.clock.clone()).generate_run_id();
            let reaped = StaleLockReaper::new(ctx.clone(), current_holder("reap", run))
                .reap_once()
                .await?;
            let reconciled = Reconciler::new(ctx, current_holder("reconcile", run))
                .reconcile_once()
                .await?;
            println!(
                "{}",
                serde_json::json!({
                    "requeued": reaped.requeued,
                    "released": reaped.released,
                    "parents_completed": reconciled.completed,
                    "parents_failed": reconciled.failed,
                    "chained": reconciled.chained,
                })
            );
            Ok(())
        }
    }
}

async fn work(ctx: Orchestrator, queue: QueueName, concurrency: usize) -> Result<()> {
    let pool = WorkerPool::spawn(ctx, queue, concurrency);
    let trigger = pool.shutdown_trigger();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "signal handler failed");
        }
        info!("shutdown requested; finishing in-flight tasks");
        trigger.fire();
    });
    pool.join().await?;
    Ok(())
}

/// Reaps, processes at most one task, then reconciles.
async fn run_once(ctx: Orchestrator, queue: QueueName) -> Result<WorkerStep> {
    let run = UlidGenerator::new(ctx.clock().clone()).generate_run_id();
    StaleLockReaper::new(ctx.clone(), current_holder("reap", run))
        .reap_once()
        .await?;

    let worker = WorkerLoop::new(ctx.clone(), queue, current_holder(format!("{queue}-worker-1"), run));
    let step = worker.step().await?;
    match &step {
        WorkerStep::Processed { task, status } => info!(task_id = %task, %status, "processed"),
        WorkerStep::Idle => info!(%queue, "nothing to claim"),
        WorkerStep::Deferred { task, retry_after } => info!(task_id = %task, ?retry_after, "rate limited"),
    }

    let reconciled = Reconciler::new(ctx, current_holder("reconcile", run))
        .reconcile_once()
        .await?;
    info!(chained = reconciled.chained.len(), "single pass finished");
    Ok(step)
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::domain::TaskStatus;

    #[test]
    fn flags_override_config_defaults() {
        let cli = Cli::parse_from([
            "spindle",
            "--max-retries",
            "5",
            "--rate-limit",
            "0",
            "status",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.rate_limit.calls, 0);
        assert_eq!(config.agent_timeout_secs, 600);
    }

    #[test]
    fn work_requires_an_executor() {
        assert!(Cli::try_parse_from(["spindle", "work", "--queue", "tdd"]).is_err());
        let cli = Cli::try_parse_from(["spindle", "work", "--queue", "tdd", "--executor", "agent run"]).unwrap();
        match cli.command {
            Command::Work { queue, executors, .. } => {
                assert_eq!(queue, QueueName::Tdd);
                assert_eq!(executors, vec!["agent run".to_string()]);
            }
            _ => panic!("expected work"),
        }
    }

    #[test]
    fn status_queue_filter_is_optional() {
        let cli = Cli::try_parse_from(["spindle", "status"]).unwrap();
        assert!(matches!(cli.command, Command::Status { queue: None }));
        let cli = Cli::try_parse_from(["spindle", "status", "--queue", "deploy"]).unwrap();
        assert!(matches!(cli.command, Command::Status { queue: Some(QueueName::Deploy) }));
        assert!(Cli::try_parse_from(["spindle", "frobnicate"]).is_err());
    }

    #[tokio::test]
    async fn once_leaves_the_rest_of_the_queue_pending() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = OrchestratorConfig::default();
        config.rate_limit.calls = 0;
        let backend = Backend::open(dir.path(), &config).unwrap();
        let store: Arc<dyn TaskStore> = backend.store.clone();
        for _ in 0..2 {
            admin::enqueue(&store, &backend.clock, QueueName::Deploy, None, 0.0, serde_json::json!({}))
                .await
                .unwrap();
        }
        let ctx = backend
            .builder(config)
            .executor(Arc::new(CommandExecutor::shell("true")))
            .build()
            .unwrap();

        let step = run_once(ctx, QueueName::Deploy).await.unwrap();
        assert!(matches!(step, WorkerStep::Processed { ref task, .. } if task.as_str() == "D001"));

        let first = store.read(&TaskId::parse("D001").unwrap()).await.unwrap();
        assert_ne!(first.status, TaskStatus::InProgress);
        let second = store.read(&TaskId::parse("D002").unwrap()).await.unwrap();
        assert_eq!(second.status, TaskStatus::Pending);
        assert_eq!(second.history.len(), 1);
    }
}
