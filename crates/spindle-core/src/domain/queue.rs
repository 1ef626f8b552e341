//! Queue names and the pipeline order between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A logically separate set of tasks, processed by its own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueName {
    Tdd,
    Deploy,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::Tdd, QueueName::Deploy];

    /// Id prefix of tasks in this queue.
    pub fn prefix(self) -> char {
        match self {
            QueueName::Tdd => 'T',
            QueueName::Deploy => 'D',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.prefix() == c)
    }

    /// Queue seeded by verified completions of this one.
    pub fn downstream(self) -> Option<QueueName> {
        match self {
            QueueName::Tdd => Some(QueueName::Deploy),
            QueueName::Deploy => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Tdd => "TDD",
            QueueName::Deploy => "DEPLOY",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown queue `{0}` (expected tdd or deploy)")]
pub struct UnknownQueue(pub String);

impl FromStr for QueueName {
    type Err = UnknownQueue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tdd" => Ok(QueueName::Tdd),
            "deploy" => Ok(QueueName::Deploy),
            _ => Err(UnknownQueue(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("TDD".parse::<QueueName>().unwrap(), QueueName::Tdd);
        assert_eq!("deploy".parse::<QueueName>().unwrap(), QueueName::Deploy);
        assert!("build".parse::<QueueName>().is_err());
    }

    #[test]
    fn pipeline_order() {
        assert_eq!(QueueName::Tdd.downstream(), Some(QueueName::Deploy));
        assert_eq!(QueueName::Deploy.downstream(), None);
        assert_eq!(QueueName::from_prefix('D'), Some(QueueName::Deploy));
        assert_eq!(QueueName::from_prefix('X'), None);
    }

    #[test]
    fn serializes_as_upper_case() {
        assert_eq!(serde_json::to_string(&QueueName::Tdd).unwrap(), "\"TDD\"");
    }
}
