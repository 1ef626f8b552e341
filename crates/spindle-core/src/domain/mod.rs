//! Domain model (ids, task record, state graph, outcomes, decisions).
//!
//! I/O を持たない純粋な型とルールだけを置く。永続化やプロセス操作は ports/impls 側。

pub mod decision;
pub mod errors;
pub mod fractal;
pub mod ids;
pub mod outcome;
pub mod queue;
pub mod retry;
pub mod state;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{CoreError, ErrorKind, ExecutorError};
pub use fractal::{DecomposeError, Settlement};
pub use ids::{AttemptId, HolderId, Id, IdMarker, RunId, TaskId};
pub use outcome::{Artifact, ChildSpec, Outcome, OutcomeKind};
pub use queue::QueueName;
pub use retry::RetryPolicy;
pub use state::TaskStatus;
pub use task::{FailureKind, HistoryEntry, Provenance, Task, Transition};
