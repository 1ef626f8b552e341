//! CommandExecutor - 外部コマンドとしての Executor
//!
//! # 契約
//! - stdin: タスク記録の JSON
//! - env: `SPINDLE_TASK_ID`, `SPINDLE_QUEUE`, `SPINDLE_DEADLINE_SECS`
//! - stdout が Outcome の JSON ならそれを採用する
//! - そうでなければ終了コードで判定する（0 成功 / 75 rate limited / 127 未インストール / その他失敗）
//! - deadline を過ぎたら子プロセスを kill して TIMEOUT を返す

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{Artifact, ExecutorError, Outcome, Task};
use crate::ports::Executor;

/// `EX_TEMPFAIL` from sysexits.h.
pub const EXIT_RATE_LIMITED: i32 = 75;
/// What `sh` returns when the command does not exist.
pub const EXIT_NOT_FOUND: i32 = 127;

const MAX_CAPTURE: usize = 64 * 1024;

pub struct CommandExecutor {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    /// Runs `line` through `sh -c`; the executor is named after the line's
    /// first word.
    pub fn shell(line: impl Into<String>) -> Self {
        let line = line.into();
        let name = line
            .split_whitespace()
            .next()
            .unwrap_or("command")
            .to_string();
        Self::new(name, "sh", vec!["-c".to_string(), line])
    }

    fn interpret(&self, code: Option<i32>, stdout: &str, stderr: &str) -> Result<Outcome, ExecutorError> {
        if let Ok(outcome) = serde_json::from_str::<Outcome>(stdout.trim()) {
            return Ok(outcome);
        }
        match code {
            Some(0) => {
                let mut outcome = Outcome::success();
                if !stdout.trim().is_empty() {
                    outcome = outcome.with_artifact(Artifact::Stdout(truncate(stdout)));
                }
                Ok(outcome)
            }
            Some(EXIT_RATE_LIMITED) => Err(ExecutorError::RateLimited {
                name: self.name.clone(),
                retry_after: None,
            }),
            Some(EXIT_NOT_FOUND) => Err(ExecutorError::Unavailable {
                name: self.name.clone(),
                reason: truncate(stderr.trim()),
            }),
            Some(code) => Ok(Outcome::failure(format!(
                "exit code {code}: {}",
                truncate(stderr.trim())
            ))),
            None => Ok(Outcome::failure("terminated by signal")),
        }
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_CAPTURE {
        return s.to_string();
    }
    let mut end = MAX_CAPTURE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, task: &Task, deadline: Instant) -> Result<Outcome, ExecutorError> {
        let input = serde_json::to_vec(task).map_err(|e| ExecutorError::Failed {
            name: self.name.clone(),
            reason: format!("encode task: {e}"),
        })?;
        let remaining = deadline.saturating_duration_since(Instant::now());

        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .env("SPINDLE_TASK_ID", task.id.as_str())
            .env("SPINDLE_QUEUE", task.queue.as_str())
            .env("SPINDLE_DEADLINE_SECS", remaining.as_secs().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ExecutorError::Unavailable {
                    name: self.name.clone(),
                    reason: format!("{}: {e}", self.program),
                });
            }
            Err(e) => {
                return Err(ExecutorError::Failed {
                    name: self.name.clone(),
                    reason: format!("spawn {}: {e}", self.program),
                });
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // The command may exit without reading its input.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(task_id = %task.id, error = %e, "executor did not read stdin");
            }
        }

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                self.interpret(output.status.code(), &stdout, &stderr)
            }
            Ok(Err(e)) => Err(ExecutorError::Failed {
                name: self.name.clone(),
                reason: format!("wait: {e}"),
            }),
            Err(_) => {
                warn!(task_id = %task.id, executor = %self.name, "executor timed out, killed");
                Ok(Outcome::timeout(format!("{} exceeded its deadline", self.name)))
            }
        }
    }
}
