//! Pattern rules applied to text added by an attempt.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Any match rejects the attempt.
    Reject,
    /// Matches add points; enough points reject.
    Warning,
}

/// A rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    pub pattern: String,
    pub severity: Severity,
    #[serde(default = "default_points")]
    pub points: u32,
    pub message: String,
    /// Warning matches beyond this count add no points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<u32>,
}

fn default_points() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub pattern: Regex,
    pub severity: Severity,
    pub points: u32,
    pub message: String,
    pub max_occurrences: Option<u32>,
}

impl Rule {
    pub fn compile(spec: &RuleSpec) -> Result<Self, GateError> {
        let pattern = Regex::new(&spec.pattern).map_err(|source| GateError::InvalidPattern {
            rule: spec.id.clone(),
            source,
        })?;
        Ok(Self {
            id: spec.id.clone(),
            pattern,
            severity: spec.severity,
            points: spec.points,
            message: spec.message.clone(),
            max_occurrences: spec.max_occurrences,
        })
    }
}

const WARNING_CAP: u32 = 3;

fn reject(id: &str, pattern: &str, points: u32, message: &str) -> RuleSpec {
    RuleSpec {
        id: id.to_string(),
        pattern: pattern.to_string(),
        severity: Severity::Reject,
        points,
        message: message.to_string(),
        max_occurrences: None,
    }
}

fn warning(id: &str, pattern: &str, message: &str) -> RuleSpec {
    RuleSpec {
        id: id.to_string(),
        pattern: pattern.to_string(),
        severity: Severity::Warning,
        points: 1,
        message: message.to_string(),
        max_occurrences: Some(WARNING_CAP),
    }
}

/// Built-in rule set: disabled tests, stubs and hardcoded secrets reject;
/// markers of unfinished or unchecked code accumulate.
pub fn builtin_rules() -> Vec<RuleSpec> {
    vec![
        reject("test-skip", r"\btest\.skip\b", 5, "test.skip: tests must run"),
        reject("describe-skip", r"\bdescribe\.skip\b", 5, "describe.skip: tests must run"),
        reject("it-skip", r"\bit\.skip\b", 5, "it.skip: tests must run"),
        reject("rust-ignore", r"#\[ignore\b", 5, "#[ignore]: tests must run"),
        reject("junit-disabled", r"@Disabled\b", 5, "@Disabled: tests must run"),
        reject("pytest-skip", r"pytest\.mark\.skip", 5, "pytest.mark.skip: tests must run"),
        reject("unimplemented", r"\bunimplemented!\s*\(", 5, "unimplemented!() left in code"),
        reject("todo-macro", r"\btodo!\s*\(", 5, "todo!() left in code"),
        reject("not-implemented-error", r"\bNotImplementedError\b", 5, "NotImplementedError stub"),
        reject(
            "panic-not-implemented",
            r#"(?i)panic!\s*\(\s*"not\s+implemented"#,
            5,
            "panic!(\"not implemented\") stub",
        ),
        reject(
            "hardcoded-secret",
            r#"(?i)\b(api[_-]?key|secret|password|passwd|token)\b\s*[:=]\s*["'][^"'\s]{8,}["']"#,
            5,
            "hardcoded credential",
        ),
        warning("todo", r"\bTODO\b", "TODO marker: incomplete code"),
        warning("fixme", r"\bFIXME\b", "FIXME marker: known issue"),
        warning("stub", r"\bSTUB\b", "STUB marker: placeholder code"),
        warning("unwrap", r"\.unwrap\(\)", ".unwrap() can panic"),
        warning("ts-ignore", r"@ts-ignore", "@ts-ignore bypasses type checking"),
        warning("as-any", r"\bas\s+any\b", "'as any' bypasses type checking"),
    ]
}
