//! Errors - エラー型と分類
//!
//! - `CoreError`: TaskStore / LockManager の失敗
//! - `ExecutorError`: Executor 境界の失敗（フォールバック判定に使う）
//! - `ErrorKind`: 運用分類。Infrastructure は WorkerPool を停止させる

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use super::state::TaskStatus;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（別タスク・次周期で回復）
/// - Permanent: 恒久的なエラー（そのタスクは諦める）
/// - Infrastructure: バックエンドの障害（プロセスを止める）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    Duplicate(String),

    /// Stored status did not match the caller's expectation (lost a race).
    #[error("invalid transition for {id}: expected {expected}, found {actual}")]
    InvalidTransition {
        id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("illegal edge for {id}: {from} -> {to}")]
    IllegalEdge {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid task id: {0:?}")]
    InvalidId(String),

    #[error("backend unavailable ({context}): {source}")]
    BackendUnavailable {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt record at {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CoreError {
    pub fn backend(context: impl Into<String>, source: io::Error) -> Self {
        CoreError::BackendUnavailable {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidTransition { .. } | CoreError::Duplicate(_) => ErrorKind::Transient,
            CoreError::NotFound(_) | CoreError::IllegalEdge { .. } | CoreError::InvalidId(_) => {
                ErrorKind::Permanent
            }
            CoreError::BackendUnavailable { .. } | CoreError::Corrupt { .. } => {
                ErrorKind::Infrastructure
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}

/// Failure at the Executor boundary.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The backend is not installed or not reachable; try the next one.
    #[error("executor {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("executor {name} rate limited")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("executor {name} failed: {reason}")]
    Failed { name: String, reason: String },
}

impl ExecutorError {
    /// Whether a ranked chain should fall through to the next executor.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            ExecutorError::Unavailable { .. } | ExecutorError::RateLimited { .. }
        )
    }
}
