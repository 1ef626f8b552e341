//! RateLimiter port - Executor 呼び出しの共有予算
//!
//! 全ワーカーが Executor を呼ぶ前に `acquire` する。拒否されたタスクは
//! 失敗扱いにせず、後で再挑戦する（backpressure）。

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::domain::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub calls_in_window: u32,
    pub remaining: u32,
    pub limit: u32,
    pub window_secs: u64,
    /// Every call admitted since the counter was created.
    pub total_calls: u64,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consumes one call from the budget if available.
    async fn acquire(&self) -> Result<Admission, CoreError>;

    async fn stats(&self) -> Result<RateLimitStats, CoreError>;
}
