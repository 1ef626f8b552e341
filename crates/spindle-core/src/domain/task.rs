//! Task record and the transition rules applied to it.
//!
//! `Task::apply` is the single place where a record changes status. Both
//! stores call it under their own mutual exclusion, so the compare-and-swap
//! check and the edge check mean the same thing regardless of backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::CoreError;
use super::ids::{AttemptId, TaskId};
use super::queue::QueueName;
use super::state::TaskStatus;

/// Why an attempt counted against the retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    AgentFailure,
    AgentTimeout,
    QualityGateRejection { rule: String },
    FractalPartial,
}

/// Link from a chained task back to the upstream task that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: TaskId,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// One line of the append-only task history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub status: TaskStatus,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue: QueueName,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub retry_count: u32,
    /// `retry_count` at the last operator reset; the ceiling counts from here.
    #[serde(default)]
    pub retry_floor: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    /// Every child ever created, across all decompositions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskId>,
    /// Children of the latest decomposition; the parent settles on these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_children: Vec<TaskId>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Task {
    /// A fresh PENDING task with its creation recorded in history.
    pub fn new(
        id: TaskId,
        queue: QueueName,
        payload: serde_json::Value,
        actor: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue,
            status: TaskStatus::Pending,
            priority: 0.0,
            retry_count: 0,
            retry_floor: 0,
            payload,
            provenance: None,
            parent: None,
            children: Vec::new(),
            active_children: Vec::new(),
            depth: 0,
            artifacts: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            history: vec![HistoryEntry {
                at: now,
                status: TaskStatus::Pending,
                actor: actor.into(),
                attempt: None,
                detail: Some("created".to_string()),
                failure: None,
            }],
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn with_parent(mut self, parent: TaskId, depth: u32) -> Self {
        self.parent = Some(parent);
        self.depth = depth;
        self
    }

    /// Failures counted against the current retry budget.
    pub fn attempts_used(&self) -> u32 {
        self.retry_count.saturating_sub(self.retry_floor)
    }

    /// How many of the most recent failures were gate rejections by `rule`,
    /// stopping at the last escalation or any other kind of failure.
    pub fn consecutive_rejections(&self, rule: &str) -> u32 {
        let mut count = 0;
        for entry in self.history.iter().rev() {
            if entry.status == TaskStatus::Blocked {
                break;
            }
            match &entry.failure {
                None => continue,
                Some(FailureKind::QualityGateRejection { rule: r }) if r == rule => count += 1,
                Some(_) => break,
            }
        }
        count
    }

    /// Compare-and-swap status change. Fails if the stored status is not
    /// `t.from` or if the edge is not in the state graph.
    pub fn apply(&mut self, t: &Transition, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status != t.from {
            return Err(CoreError::InvalidTransition {
                id: self.id.to_string(),
                expected: t.from,
                actual: self.status,
            });
        }
        if !t.from.can_transition_to(t.to) {
            return Err(CoreError::IllegalEdge {
                id: self.id.to_string(),
                from: t.from,
                to: t.to,
            });
        }

        if t.failure.is_some() {
            self.retry_count += 1;
            self.last_error = t.detail.clone();
        }
        if t.reset {
            self.retry_floor = self.retry_count;
        }
        if let Some(children) = &t.children {
            for child in children {
                if !self.children.contains(child) {
                    self.children.push(child.clone());
                }
            }
            self.active_children = children.clone();
        }
        if let Some(artifacts) = &t.artifacts {
            self.artifacts = artifacts.clone();
        }

        self.status = t.to;
        self.updated_at = now;
        self.history.push(HistoryEntry {
            at: now,
            status: t.to,
            actor: t.actor.clone(),
            attempt: t.attempt,
            detail: t.detail.clone(),
            failure: t.failure.clone(),
        });
        Ok(())
    }
}

/// A requested status change, checked and applied by `Task::apply`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub actor: String,
    pub attempt: Option<AttemptId>,
    pub detail: Option<String>,
    pub failure: Option<FailureKind>,
    pub children: Option<Vec<TaskId>>,
    pub artifacts: Option<Vec<String>>,
    pub reset: bool,
}

impl Transition {
    pub fn new(from: TaskStatus, to: TaskStatus, actor: impl Into<String>) -> Self {
        Self {
            from,
            to,
            actor: actor.into(),
            attempt: None,
            detail: None,
            failure: None,
            children: None,
            artifacts: None,
            reset: false,
        }
    }

    pub fn with_attempt(mut self, attempt: AttemptId) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Records a failure; applying it increments `retry_count`.
    pub fn with_failure(mut self, failure: FailureKind) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_children(mut self, children: Vec<TaskId>) -> Self {
        self.children = Some(children);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Operator reset: the retry budget restarts from the current count.
    pub fn as_reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn task() -> Task {
        Task::new(
            TaskId::parse("T001").unwrap(),
            QueueName::Tdd,
            serde_json::json!({"goal": "x"}),
            "planner",
            now(),
        )
    }

    #[test]
    fn apply_checks_expected_status() {
        let mut t = task();
        let err = t
            .apply(
                &Transition::new(TaskStatus::InProgress, TaskStatus::Complete, "w"),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.history.len(), 1);
    }

    #[test]
    fn apply_rejects_edges_that_skip_in_progress() {
        let mut t = task();
        let err = t
            .apply(
                &Transition::new(TaskStatus::Pending, TaskStatus::Complete, "w"),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::IllegalEdge { .. }));
    }

    #[test]
    fn failure_increments_retry_and_extends_history() {
        let mut t = task();
        t.apply(
            &Transition::new(TaskStatus::Pending, TaskStatus::InProgress, "w"),
            now(),
        )
        .unwrap();
        t.apply(
            &Transition::new(TaskStatus::InProgress, TaskStatus::Failed, "w")
                .with_failure(FailureKind::AgentTimeout)
                .with_detail("deadline exceeded"),
            now(),
        )
        .unwrap();

        assert_eq!(t.retry_count, 1);
        assert_eq!(t.last_error.as_deref(), Some("deadline exceeded"));
        let statuses: Vec<_> = t.history.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Failed]
        );
    }

    #[test]
    fn reset_moves_floor_without_decreasing_count() {
        let mut t = task();
        t.status = TaskStatus::Failed;
        t.retry_count = 3;
        t.apply(
            &Transition::new(TaskStatus::Failed, TaskStatus::Pending, "operator").as_reset(),
            now(),
        )
        .unwrap();
        assert_eq!(t.retry_count, 3);
        assert_eq!(t.attempts_used(), 0);
    }

    #[test]
    fn consecutive_rejections_stop_at_other_failures() {
        let mut t = task();
        let reject = |rule: &str| FailureKind::QualityGateRejection {
            rule: rule.to_string(),
        };
        for failure in [FailureKind::AgentFailure, reject("skip"), reject("skip")] {
            t.status = TaskStatus::InProgress;
            t.apply(
                &Transition::new(TaskStatus::InProgress, TaskStatus::Failed, "w")
                    .with_failure(failure),
                now(),
            )
            .unwrap();
            t.apply(
                &Transition::new(TaskStatus::Failed, TaskStatus::Pending, "w"),
                now(),
            )
            .unwrap();
        }
        assert_eq!(t.consecutive_rejections("skip"), 2);
        assert_eq!(t.consecutive_rejections("stub"), 0);
    }

    #[test]
    fn children_are_appended_once() {
        let mut t = task();
        t.status = TaskStatus::InProgress;
        let kids = vec![t.id.child(1), t.id.child(2)];
        t.apply(
            &Transition::new(TaskStatus::InProgress, TaskStatus::Decomposed, "w")
                .with_children(kids.clone()),
            now(),
        )
        .unwrap();
        assert_eq!(t.children, kids);
        assert_eq!(t.active_children, kids);
    }

    #[test]
    fn redecomposition_replaces_active_children() {
        let mut t = task();
        t.status = TaskStatus::InProgress;
        t.apply(
            &Transition::new(TaskStatus::InProgress, TaskStatus::Decomposed, "w")
                .with_children(vec![t.id.child(1), t.id.child(2)]),
            now(),
        )
        .unwrap();
        t.apply(
            &Transition::new(TaskStatus::Decomposed, TaskStatus::Failed, "r")
                .with_failure(FailureKind::FractalPartial),
            now(),
        )
        .unwrap();
        t.apply(&Transition::new(TaskStatus::Failed, TaskStatus::Pending, "r"), now())
            .unwrap();
        t.apply(&Transition::new(TaskStatus::Pending, TaskStatus::InProgress, "w"), now())
            .unwrap();
        t.apply(
            &Transition::new(TaskStatus::InProgress, TaskStatus::Decomposed, "w")
                .with_children(vec![t.id.child(3)]),
            now(),
        )
        .unwrap();

        assert_eq!(t.children.len(), 3);
        assert_eq!(t.active_children, vec![t.id.child(3)]);
    }

    #[test]
    fn record_serializes_with_upper_case_enums() {
        let v = serde_json::to_value(task()).unwrap();
        assert_eq!(v["status"], "PENDING");
        assert_eq!(v["queue"], "TDD");
        assert_eq!(v["id"], "T001");
        let back: Task = serde_json::from_value(v).unwrap();
        assert_eq!(back, task());
    }
}
