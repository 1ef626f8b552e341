//! Domain identifiers.
//!
//! # 二種類の ID
//! - **TaskId**: 人間が読む queue-scoped な文字列（`T001`, `D007`, `T001.2`）。
//!   先頭 1 文字がキューを表す。ファイル名としてそのまま使えるよう文字種を制限する。
//! - **Id<T>**: ULID ベースの内部 ID（AttemptId, RunId）。Phantom type で型を分ける。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順序でソートできる
//! - **分散生成可能**: 調整なしで複数プロセスで生成できる

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

use super::errors::CoreError;
use super::queue::QueueName;

/// IdMarker は各 ULID ID 型のマーカー trait
///
/// Display で使うプレフィックス（"attempt-", "run-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ULID ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Attempt のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attempt {}

impl IdMarker for Attempt {
    fn prefix() -> &'static str {
        "attempt-"
    }
}

/// Run（ワーカープロセスの 1 回の起動）のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

/// Identifier of one claim-and-execute attempt on a task.
pub type AttemptId = Id<Attempt>;

/// Identifier of one worker process lifetime.
pub type RunId = Id<Run>;

/// Queue-scoped task identifier, e.g. `T001` or `D007`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && raw.starts_with(|c: char| c.is_ascii_alphabetic())
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if valid {
            Ok(Self(raw))
        } else {
            Err(CoreError::InvalidId(raw))
        }
    }

    /// `numbered(Tdd, 7)` -> `T007`.
    pub fn numbered(queue: QueueName, n: u32) -> Self {
        Self(format!("{}{:03}", queue.prefix(), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The queue this id claims to belong to, judged by its prefix.
    pub fn queue(&self) -> Option<QueueName> {
        self.0.chars().next().and_then(QueueName::from_prefix)
    }

    /// Numeric part of a top-level id (`T012` -> 12). Child ids have none.
    pub fn sequence(&self) -> Option<u32> {
        let rest = &self.0[1..];
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        rest.parse().ok()
    }

    /// Same id re-prefixed for another queue (`T001` -> `D001`).
    pub fn counterpart(&self, queue: QueueName) -> Self {
        Self(format!("{}{}", queue.prefix(), &self.0[1..]))
    }

    /// Id of the n-th child produced by decomposition (`T001` -> `T001.3`).
    pub fn child(&self, n: usize) -> Self {
        Self(format!("{}.{}", self.0, n))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// Identity of a lock holder: which worker, in which process.
///
/// `start_ticks` is the kernel start time of `pid` (from `/proc/<pid>/stat`)
/// when it could be read; a mismatch later means the pid was reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HolderId {
    pub worker: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ticks: Option<u64>,
    pub run: RunId,
}

impl HolderId {
    pub fn new(worker: impl Into<String>, pid: u32, start_ticks: Option<u64>, run: RunId) -> Self {
        Self {
            worker: worker.into(),
            pid,
            start_ticks,
            run,
        }
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.worker, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulid_ids_have_distinct_prefixes() {
        let attempt = AttemptId::from_ulid(Ulid::new());
        let run = RunId::from_ulid(Ulid::new());

        assert!(attempt.to_string().starts_with("attempt-"));
        assert!(run.to_string().starts_with("run-"));
        // let _: RunId = attempt; // <- does not compile
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<AttemptId>(), size_of::<Ulid>());
    }

    #[test]
    fn task_id_rejects_path_like_input() {
        assert!(TaskId::parse("T001").is_ok());
        assert!(TaskId::parse("T001.2").is_ok());
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse("../T001").is_err());
        assert!(TaskId::parse("T0/01").is_err());
        assert!(TaskId::parse("1T").is_err());
    }

    #[test]
    fn task_id_helpers() {
        let id = TaskId::numbered(QueueName::Tdd, 7);
        assert_eq!(id.as_str(), "T007");
        assert_eq!(id.queue(), Some(QueueName::Tdd));
        assert_eq!(id.sequence(), Some(7));
        assert_eq!(id.counterpart(QueueName::Deploy).as_str(), "D007");
        assert_eq!(id.child(2).as_str(), "T007.2");
        assert_eq!(id.child(2).sequence(), None);
    }

    #[test]
    fn task_id_serializes_as_plain_string() {
        let id = TaskId::parse("D042").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"D042\"");
        let bad: Result<TaskId, _> = serde_json::from_str("\"../x\"");
        assert!(bad.is_err());
    }
}
