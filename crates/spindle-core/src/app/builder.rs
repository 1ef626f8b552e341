//! AppBuilder - Orchestrator の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - TaskStore / LockManager が未設定なら build() で失敗する
//! - Executor が 1 つも登録されていなければ失敗する
//! - gate のカスタムルールが不正（regex エラー）なら失敗する
//!
//! 起動後に設定ミスで全タスクを FAILED にするより、起動時に止まる方がよい。

use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::domain::{Decider, DefaultDecider};
use crate::gate::{GateError, QualityGate};
use crate::impls::{ExecutorChain, InMemoryRateLimiter, ProcessProbe, SlidingWindow};
use crate::ports::{
    Clock, Executor, IdGenerator, LivenessProbe, LockManager, RateLimiter, SystemClock, TaskStore,
    UlidGenerator,
};

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no task store configured")]
    MissingStore,

    #[error("no lock manager configured")]
    MissingLocks,

    #[error("no executors registered; at least one is required")]
    NoExecutors,

    #[error("invalid quality gate configuration: {0}")]
    Gate(#[from] GateError),
}

/// Everything a worker, the reaper and the reconciler need, shared by
/// reference count. Cloning is cheap.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) gate: Arc<QualityGate>,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) rate_limiter: Arc<dyn RateLimiter>,
    pub(crate) liveness: Arc<dyn LivenessProbe>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
}

impl Orchestrator {
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn rate_limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.rate_limiter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

/// AppBuilder は Orchestrator を構築
///
/// # 使用例
/// ```ignore
/// let orchestrator = AppBuilder::new(config)
///     .store(Arc::new(FsTaskStore::open_default(&root)?))
///     .locks(Arc::new(FsLockManager::open_default(&root)?))
///     .executor(Arc::new(CommandExecutor::shell("claude-agent")))
///     .executor(Arc::new(CommandExecutor::shell("fallback-agent")))
///     .build()?;
/// ```
pub struct AppBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn TaskStore>>,
    locks: Option<Arc<dyn LockManager>>,
    executors: Vec<Arc<dyn Executor>>,
    decider: Option<Arc<dyn Decider>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    liveness: Option<Arc<dyn LivenessProbe>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl AppBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            locks: None,
            executors: Vec::new(),
            decider: None,
            rate_limiter: None,
            liveness: None,
            clock: None,
            ids: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Registers an executor. Registration order is fallback order.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn liveness(mut self, liveness: Arc<dyn LivenessProbe>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// 検証してから Orchestrator を生成。未指定の部品はデフォルト実装で埋める。
    pub fn build(self) -> Result<Orchestrator, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let locks = self.locks.ok_or(BuildError::MissingLocks)?;
        if self.executors.is_empty() {
            return Err(BuildError::NoExecutors);
        }
        let gate = QualityGate::new(&self.config.gate)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let executor: Arc<dyn Executor> = if self.executors.len() == 1 {
            self.executors.into_iter().next().ok_or(BuildError::NoExecutors)?
        } else {
            Arc::new(ExecutorChain::new(self.executors))
        };
        let config = self.config;
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(config.retry_policy())));
        let rate_limiter = self.rate_limiter.unwrap_or_else(|| {
            Arc::new(InMemoryRateLimiter::new(
                SlidingWindow::new(
                    config.rate_limit.calls,
                    std::time::Duration::from_secs(config.rate_limit.window_secs),
                ),
                clock.clone(),
            ))
        });
        let liveness = self.liveness.unwrap_or_else(|| Arc::new(ProcessProbe));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        Ok(Orchestrator {
            config,
            store,
            locks,
            executor,
            gate: Arc::new(gate),
            decider,
            rate_limiter,
            liveness,
            clock,
            ids,
        })
    }
}
