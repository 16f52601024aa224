//! Configuration for the conclave runtime.
//!
//! [`ConclaveConfig`] is constructed manually by the embedding application —
//! the core performs no file parsing and no API-key management.  Call
//! [`ConclaveConfig::validate`] after construction to reject out-of-range
//! values, and [`ConclaveConfig::clamp`] to coerce the soft limits into range
//! with a logged warning.
//!
//! # Example
//!
//! ```rust
//! use conclave::ConclaveConfig;
//!
//! let mut config = ConclaveConfig::default();
//! config.max_tokens = 8192;
//! config.clamp();
//! config.validate().unwrap();
//! ```

use crate::conclave::agent_runtime::HistoryMode;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Largest permitted session-history injection, in messages.
pub const SESSION_HISTORY_LIMIT: usize = 25;

/// Invalid configuration values found by [`ConclaveConfig::validate`].
#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl Error for ConfigError {}

/// Runtime configuration, received as a plain struct.
#[derive(Debug, Clone)]
pub struct ConclaveConfig {
    /// Path of the SQLite database file.
    pub database_path: PathBuf,
    /// Days of flat performance-log rows to retain; pruning removes older
    /// rows.  Must be at least 1.
    pub metrics_retention_days: u32,
    /// Full URL of the completion endpoint.
    pub completion_endpoint_url: String,
    /// Model identifier used for agent completions unless overridden.
    pub default_model: String,
    /// Generation cap forwarded on every request.  Must be at least 100.
    pub max_tokens: u32,
    /// Wall-clock budget per streaming call, in seconds.
    pub request_timeout_seconds: u64,
    /// Agents whose overall success rate falls below this are candidates for
    /// prompt refinement.  In `[0, 1]`.
    pub prompt_refinement_threshold: f64,
    /// Minimum per-arm sample count before an A/B test may promote.
    pub ab_test_minimum_samples: u64,
    /// Task types with a success rate above this are classed strong.
    /// Must exceed `weak_performance_threshold`; in `[0, 1]`.
    pub strong_performance_threshold: f64,
    /// Task types with a success rate below this are classed weak.
    pub weak_performance_threshold: f64,
    /// Upper bound on injected session history, in `0..=25`.
    pub max_session_history_count: usize,
    /// History mode used when a directive does not specify one.
    pub default_history_mode: HistoryMode,
    /// Directory the embedding application loads canonical prompts from.
    /// The core never reads it; it is carried for the bootstrap caller.
    pub base_prompts_path: PathBuf,
}

impl Default for ConclaveConfig {
    fn default() -> Self {
        ConclaveConfig {
            database_path: PathBuf::from("conclave.db"),
            metrics_retention_days: 30,
            completion_endpoint_url: "https://api.anthropic.com/v1/messages".to_string(),
            default_model: "claude-sonnet-4-0".to_string(),
            max_tokens: 4096,
            request_timeout_seconds: 300,
            prompt_refinement_threshold: 0.6,
            ab_test_minimum_samples: 10,
            strong_performance_threshold: 0.8,
            weak_performance_threshold: 0.6,
            max_session_history_count: SESSION_HISTORY_LIMIT,
            default_history_mode: HistoryMode::Conversational,
            base_prompts_path: PathBuf::from("base_prompts"),
        }
    }
}

impl ConclaveConfig {
    /// Reject configurations that violate hard constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics_retention_days < 1 {
            return Err(ConfigError("metrics_retention_days must be >= 1".into()));
        }
        if self.max_tokens < 100 {
            return Err(ConfigError("max_tokens must be >= 100".into()));
        }
        if self.completion_endpoint_url.is_empty() {
            return Err(ConfigError("completion_endpoint_url must not be empty".into()));
        }
        if self.default_model.is_empty() {
            return Err(ConfigError("default_model must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.prompt_refinement_threshold) {
            return Err(ConfigError(
                "prompt_refinement_threshold must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.strong_performance_threshold)
            || !(0.0..=1.0).contains(&self.weak_performance_threshold)
        {
            return Err(ConfigError(
                "performance thresholds must be in [0, 1]".into(),
            ));
        }
        if self.strong_performance_threshold <= self.weak_performance_threshold {
            return Err(ConfigError(
                "strong_performance_threshold must exceed weak_performance_threshold".into(),
            ));
        }
        if self.max_session_history_count > SESSION_HISTORY_LIMIT {
            return Err(ConfigError(format!(
                "max_session_history_count must be in 0..={}",
                SESSION_HISTORY_LIMIT
            )));
        }
        Ok(())
    }

    /// Coerce soft limits into range, logging a warning for each adjustment.
    pub fn clamp(&mut self) {
        if self.max_session_history_count > SESSION_HISTORY_LIMIT {
            log::warn!(
                "max_session_history_count {} exceeds limit {}; clamping",
                self.max_session_history_count,
                SESSION_HISTORY_LIMIT
            );
            self.max_session_history_count = SESSION_HISTORY_LIMIT;
        }
        if self.max_tokens < 100 {
            log::warn!("max_tokens {} below minimum 100; clamping", self.max_tokens);
            self.max_tokens = 100;
        }
        if self.metrics_retention_days < 1 {
            log::warn!("metrics_retention_days below 1; clamping");
            self.metrics_retention_days = 1;
        }
    }
}
