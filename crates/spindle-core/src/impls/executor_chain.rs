//! ExecutorChain - ranked fallback over several executors.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::warn;

use crate::domain::{ExecutorError, Outcome, Task};
use crate::ports::Executor;

/// Tries executors in order. An executor that is unavailable or rate
/// limited hands over to the next one; any real outcome (including a
/// reported failure) ends the chain.
pub struct ExecutorChain {
    executors: Vec<Arc<dyn Executor>>,
}

impl ExecutorChain {
    pub fn new(executors: Vec<Arc<dyn Executor>>) -> Self {
        Self { executors }
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[async_trait]
impl Executor for ExecutorChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn run(&self, task: &Task, deadline: Instant) -> Result<Outcome, ExecutorError> {
        let mut last = None;
        for executor in &self.executors {
            match executor.run(task, deadline).await {
                Err(e) if e.allows_fallback() => {
                    warn!(task_id = %task.id, executor = executor.name(), error = %e, "falling back");
                    last = Some(e);
                }
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| ExecutorError::Unavailable {
            name: "chain".to_string(),
            reason: "no executors configured".to_string(),
        }))
    }
}
