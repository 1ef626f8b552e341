//! Executor port - タスクを実際に処理する外部コラボレータ
//!
//! コア側は payload を解釈しない。Executor が返す Outcome も信用しない
//! （QualityGate が成果物から検証し直す）。

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{ExecutorError, Outcome, Task};

#[async_trait]
pub trait Executor: Send + Sync {
    /// Name used in logs and in fallback diagnostics.
    fn name(&self) -> &str;

    /// Performs the work for `task`. Should give up by `deadline`; the
    /// worker also enforces it from the outside.
    async fn run(&self, task: &Task, deadline: Instant) -> Result<Outcome, ExecutorError>;
}
