//! Orchestrator configuration.
//!
//! Read from TOML; every field has a default so a partial file (or none)
//! is valid. Command-line flags and environment variables are applied on
//! top by the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::gate::GateConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls admitted per window; 0 disables limiting.
    pub calls: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls: 200,
            window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub agent_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Ceiling of the idle backoff.
    pub max_idle_ms: u64,
    pub reaper_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Identical gate rejections in a row before BLOCKED; 0 disables.
    pub escalate_after_rejections: u32,
    pub max_decompose_depth: u32,
    pub rate_limit: RateLimitConfig,
    pub gate: GateConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            agent_timeout_secs: 600,
            poll_interval_ms: 1000,
            max_idle_ms: 10_000,
            reaper_interval_secs: 30,
            reconcile_interval_secs: 10,
            escalate_after_rejections: 2,
            max_decompose_depth: 3,
            rate_limit: RateLimitConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw, &path.display().to_string())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.escalate_after_rejections)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms.max(self.poll_interval_ms))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}
