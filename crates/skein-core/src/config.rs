use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkeinError};

/// Top-level engine configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency ceiling for asynchronous top-level invocations.
    /// Enqueuing is never blocked; processing is.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Keep terminal activations and their transits in the store instead
    /// of cleaning them up (diagnostics mode).
    #[serde(default)]
    pub retain_finished: bool,

    /// How the terminal status is decided at fan-in.
    #[serde(default)]
    pub completion: CompletionPolicy,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retain_finished: false,
            completion: CompletionPolicy::default(),
            retry: RetryConfig::default(),
            callback_timeout_secs: default_callback_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SkeinError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content).map_err(|e| SkeinError::Config(e.to_string()))
    }
}

fn default_max_concurrent() -> usize {
    32
}

fn default_callback_timeout() -> u64 {
    10
}

/// Terminal-status decision at the completion point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionPolicy {
    /// ERROR if any transit ended in ERROR, else COMPLETE.
    #[default]
    Strict,
    /// COMPLETE whenever finalize itself did not fault, ignoring partial
    /// transit failure. Kept for backward compatibility only.
    Legacy,
}

/// Backoff configuration for the optional retry path. Off unless an
/// operator turns it on explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_retry_wait")]
    pub wait_secs: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_secs: default_retry_wait(),
            multiplier: default_retry_multiplier(),
            max_attempts: default_retry_attempts(),
        }
    }
}

fn default_retry_wait() -> u64 {
    10
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_attempts() -> u32 {
    5
}
