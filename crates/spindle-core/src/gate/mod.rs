//! QualityGate - Executor の自己申告を成果物から検証し直す
//!
//! 決定的（LLM を使わない）な事後条件チェック。
//! - 追加されたテキストに対するパターンルール（reject / warning）
//! - 検証コマンドが実行されたか、成功したか
//! - ファイル変更が存在するか（下流キューへ連鎖するキューのみ）
//!
//! REJECTED は Executor の SUCCESS を必ず上書きし、リトライ経路に送る。

pub mod rules;

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::domain::{Artifact, Outcome, QueueName};
pub use rules::{Rule, RuleSpec, Severity};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("rule {rule}: invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("threshold must be greater than zero")]
    ZeroThreshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Accumulated points at which an attempt is rejected.
    pub threshold: u32,
    pub require_verification: bool,
    /// Only enforced for queues that feed a downstream queue.
    pub require_changes: bool,
    /// Extra rules, checked after the built-in ones.
    pub rules: Vec<RuleSpec>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            require_verification: true,
            require_changes: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub rule: String,
    pub severity: Severity,
    pub points: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub line: usize,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub score: u32,
    pub threshold: u32,
    pub issues: Vec<Issue>,
    /// Actionable text recorded in history for the next attempt.
    pub feedback: String,
}

impl Rejection {
    /// Rule blamed for the rejection, used to detect repeats: the first
    /// reject-severity issue, otherwise the warning rule with most points.
    pub fn primary_rule(&self) -> &str {
        if let Some(issue) = self.issues.iter().find(|i| i.severity == Severity::Reject) {
            return &issue.rule;
        }
        let mut totals: Vec<(&str, u32)> = Vec::new();
        for issue in &self.issues {
            match totals.iter_mut().find(|(rule, _)| *rule == issue.rule) {
                Some((_, points)) => *points += issue.points,
                None => totals.push((&issue.rule, issue.points)),
            }
        }
        totals
            .into_iter()
            .fold(None, |best: Option<(&str, u32)>, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            })
            .map(|(rule, _)| rule)
            .unwrap_or("score")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    CleanWithWarnings(Vec<Issue>),
    Rejected(Rejection),
}

pub struct QualityGate {
    rules: Vec<Rule>,
    threshold: u32,
    require_verification: bool,
    require_changes: bool,
}

impl QualityGate {
    pub fn new(config: &GateConfig) -> Result<Self, GateError> {
        if config.threshold == 0 {
            return Err(GateError::ZeroThreshold);
        }
        let rules = rules::builtin_rules()
            .iter()
            .chain(config.rules.iter())
            .map(Rule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            threshold: config.threshold,
            require_verification: config.require_verification,
            require_changes: config.require_changes,
        })
    }

    /// Checks a SUCCESS outcome of a task in `queue`.
    pub fn verify(&self, queue: QueueName, outcome: &Outcome) -> Verdict {
        let mut issues = Vec::new();
        let mut changes = 0;

        for artifact in &outcome.artifacts {
            if let Artifact::FileChange { path, added } = artifact {
                changes += 1;
                self.scan(path, added, &mut issues);
            }
        }

        if self.require_changes && queue.downstream().is_some() && changes == 0 {
            issues.push(structural("no-changes", "no file changes reported"));
        }

        let verifications: Vec<(&str, i32)> = outcome.verifications().collect();
        if self.require_verification && verifications.is_empty() {
            issues.push(structural(
                "no-verification",
                "no verification command was run",
            ));
        }
        for (command, exit_code) in verifications {
            if exit_code != 0 {
                issues.push(structural(
                    "verification-failed",
                    &format!("`{command}` exited with {exit_code}"),
                ));
            }
        }

        if issues.is_empty() {
            return Verdict::Clean;
        }

        let score: u32 = issues.iter().map(|i| i.points).sum();
        let blocking = issues.iter().any(|i| i.severity == Severity::Reject);
        if blocking || score >= self.threshold {
            let feedback = feedback(&issues);
            return Verdict::Rejected(Rejection {
                score,
                threshold: self.threshold,
                issues,
                feedback,
            });
        }
        Verdict::CleanWithWarnings(issues)
    }

    fn scan(&self, path: &str, added: &str, issues: &mut Vec<Issue>) {
        for rule in &self.rules {
            let mut seen = 0u32;
            for (n, line) in added.lines().enumerate() {
                if !rule.pattern.is_match(line) {
                    continue;
                }
                seen += 1;
                if rule.max_occurrences.is_some_and(|cap| seen > cap) {
                    break;
                }
                issues.push(Issue {
                    rule: rule.id.clone(),
                    severity: rule.severity,
                    points: rule.points,
                    message: rule.message.clone(),
                    path: Some(path.to_string()),
                    line: n + 1,
                    context: line.trim().chars().take(80).collect(),
                });
            }
        }
    }
}

fn structural(rule: &str, message: &str) -> Issue {
    Issue {
        rule: rule.to_string(),
        severity: Severity::Reject,
        points: 5,
        message: message.to_string(),
        path: None,
        line: 0,
        context: String::new(),
    }
}

fn feedback(issues: &[Issue]) -> String {
    let mut out = String::from("Rejected by quality gate. Fix the following:");
    let rejects: Vec<&Issue> = issues.iter().filter(|i| i.severity == Severity::Reject).collect();
    let warnings: Vec<&Issue> = issues.iter().filter(|i| i.severity == Severity::Warning).collect();

    if !rejects.is_empty() {
        out.push_str("\nMUST FIX:");
        for issue in rejects.iter().take(5) {
            let _ = write!(out, "\n  - {}", location(issue));
            if !issue.context.is_empty() {
                let _ = write!(out, "\n    context: {}", issue.context);
            }
        }
    }
    if !warnings.is_empty() {
        out.push_str("\nSHOULD FIX:");
        for issue in warnings.iter().take(5) {
            let _ = write!(out, "\n  - {}", location(issue));
        }
    }
    out
}

fn location(issue: &Issue) -> String {
    match &issue.path {
        Some(path) => format!("{}:{}: {}", path, issue.line, issue.message),
        None => issue.message.clone(),
    }
}
