//! Sliding-window rate limiters.
//!
//! - `InMemoryRateLimiter`: one process, shared by its workers
//! - `FileRateLimiter`: every process on the same root; the window lives in
//!   `<root>/rate_limit.json` and is updated under `<root>/rate_limit.lock`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::fs_util::{blocking, lock_file, read_json, write_replace};
use crate::domain::CoreError;
use crate::ports::{Admission, Clock, RateLimitStats, RateLimiter};

/// Persisted part of the window: admission times (ms since epoch) still
/// inside it, plus a running total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    #[serde(default)]
    pub calls: Vec<i64>,
    #[serde(default)]
    pub total_calls: u64,
}

/// `limit` calls per `window`. A limit of 0 admits everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    pub limit: u32,
    pub window: Duration,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    fn prune(&self, state: &mut WindowState, now: DateTime<Utc>) {
        let cutoff = now.timestamp_millis().saturating_sub(self.window_ms());
        state.calls.retain(|&at| at > cutoff);
    }

    pub fn admit(&self, state: &mut WindowState, now: DateTime<Utc>) -> Admission {
        self.prune(state, now);
        if self.limit > 0 && state.calls.len() >= self.limit as usize {
            let oldest = state.calls.iter().copied().min().unwrap_or(now.timestamp_millis());
            let wait_ms = (oldest + self.window_ms() - now.timestamp_millis()).max(1);
            return Admission::Denied {
                retry_after: Duration::from_millis(wait_ms as u64),
            };
        }
        state.calls.push(now.timestamp_millis());
        state.total_calls += 1;
        Admission::Allowed
    }

    pub fn stats(&self, state: &mut WindowState, now: DateTime<Utc>) -> RateLimitStats {
        self.prune(state, now);
        let in_window = u32::try_from(state.calls.len()).unwrap_or(u32::MAX);
        RateLimitStats {
            calls_in_window: in_window,
            remaining: if self.limit == 0 {
                u32::MAX
            } else {
                self.limit.saturating_sub(in_window)
            },
            limit: self.limit,
            window_secs: self.window.as_secs(),
            total_calls: state.total_calls,
        }
    }
}

pub struct InMemoryRateLimiter {
    window: SlidingWindow,
    state: Mutex<WindowState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimiter {
    pub fn new(window: SlidingWindow, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            state: Mutex::new(WindowState::default()),
            clock,
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn acquire(&self) -> Result<Admission, CoreError> {
        let mut state = self.state.lock().await;
        Ok(self.window.admit(&mut state, self.clock.now()))
    }

    async fn stats(&self) -> Result<RateLimitStats, CoreError> {
        let mut state = self.state.lock().await;
        Ok(self.window.stats(&mut state, self.clock.now()))
    }
}

pub struct FileRateLimiter {
    window: SlidingWindow,
    state_path: PathBuf,
    lock_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileRateLimiter {
    pub fn new(root: impl Into<PathBuf>, window: SlidingWindow, clock: Arc<dyn Clock>) -> Self {
        let root = root.into();
        Self {
            window,
            state_path: root.join("rate_limit.json"),
            lock_path: root.join("rate_limit.lock"),
            clock,
        }
    }

    async fn with_state<T, F>(&self, context: &'static str, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&SlidingWindow, &mut WindowState, DateTime<Utc>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let window = self.window;
        let state_path = self.state_path.clone();
        let lock_path = self.lock_path.clone();
        let now = self.clock.now();
        blocking(context, move || {
            let _guard = lock_file(&lock_path)?;
            let mut state = read_json::<WindowState>(&state_path)?.unwrap_or_default();
            let out = f(&window, &mut state, now);
            write_replace(&state_path, &state)?;
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl RateLimiter for FileRateLimiter {
    async fn acquire(&self) -> Result<Admission, CoreError> {
        let admission = self
            .with_state("rate limit acquire", |w, s, now| w.admit(s, now))
            .await?;
        if let Admission::Denied { retry_after } = admission {
            debug!(retry_after_ms = retry_after.as_millis() as u64, "rate limit reached");
        }
        Ok(admission)
    }

    async fn stats(&self) -> Result<RateLimitStats, CoreError> {
        self.with_state("rate limit stats", |w, s, now| w.stats(s, now))
            .await
    }
}
