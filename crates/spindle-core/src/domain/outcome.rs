//! Outcome model: the result format an Executor reports for one attempt.
//!
//! Nothing here is trusted. The quality gate re-derives "did it really work"
//! from the artifacts; the worker derives the next status from the gate.

use serde::{Deserialize, Serialize};

/// Classification of an attempt result, as reported by the Executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
    Timeout,
    Decomposed,
}

/// Something observable produced during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Artifact {
    /// A file the attempt touched, with the text it added.
    FileChange {
        path: String,
        #[serde(default)]
        added: String,
    },

    /// A verification command that was actually run (tests, build, lint).
    Verification { command: String, exit_code: i32 },

    /// Free-form output captured from the executor.
    Stdout(String),
}

/// A child task requested by a DECOMPOSED outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub payload: serde_json::Value,

    /// Inherits the parent's priority when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
}

impl ChildSpec {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            priority: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_tasks: Vec<ChildSpec>,
}

impl Outcome {
    fn of(kind: OutcomeKind) -> Self {
        Self {
            kind,
            artifacts: Vec::new(),
            reason: None,
            child_tasks: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::of(OutcomeKind::Success)
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::of(OutcomeKind::Failure).with_reason(reason)
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::of(OutcomeKind::Timeout).with_reason(reason)
    }

    pub fn decomposed(children: Vec<ChildSpec>) -> Self {
        let mut outcome = Self::of(OutcomeKind::Decomposed);
        outcome.child_tasks = children;
        outcome
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_file_change(self, path: impl Into<String>, added: impl Into<String>) -> Self {
        self.with_artifact(Artifact::FileChange {
            path: path.into(),
            added: added.into(),
        })
    }

    pub fn with_verification(self, command: impl Into<String>, exit_code: i32) -> Self {
        self.with_artifact(Artifact::Verification {
            command: command.into(),
            exit_code,
        })
    }

    /// Paths of files touched, in report order, without duplicates.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for artifact in &self.artifacts {
            if let Artifact::FileChange { path, .. } = artifact
                && !paths.contains(path)
            {
                paths.push(path.clone());
            }
        }
        paths
    }

    pub fn verifications(&self) -> impl Iterator<Item = (&str, i32)> {
        self.artifacts.iter().filter_map(|a| match a {
            Artifact::Verification { command, exit_code } => Some((command.as_str(), *exit_code)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_serializes_as_required_names() {
        let s = serde_json::to_string(&OutcomeKind::Decomposed).unwrap();
        assert_eq!(s, "\"DECOMPOSED\"");
        let s = serde_json::to_string(&OutcomeKind::Timeout).unwrap();
        assert_eq!(s, "\"TIMEOUT\"");
    }

    #[test]
    fn executor_json_report_parses() {
        let raw = r#"{
            "kind": "SUCCESS",
            "artifacts": [
                {"kind": "FileChange", "value": {"path": "src/lib.rs", "added": "fn a() {}"}},
                {"kind": "Verification", "value": {"command": "cargo test", "exit_code": 0}}
            ]
        }"#;
        let outcome: Outcome = serde_json::from_str(raw).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Success);
        assert_eq!(outcome.changed_paths(), vec!["src/lib.rs".to_string()]);
        assert_eq!(outcome.verifications().collect::<Vec<_>>(), vec![("cargo test", 0)]);
        assert!(outcome.child_tasks.is_empty());
    }

    #[test]
    fn changed_paths_are_deduplicated() {
        let outcome = Outcome::success()
            .with_file_change("a.rs", "x")
            .with_file_change("b.rs", "y")
            .with_file_change("a.rs", "z");
        assert_eq!(outcome.changed_paths(), vec!["a.rs", "b.rs"]);
    }
}
