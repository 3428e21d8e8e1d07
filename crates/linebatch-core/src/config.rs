//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::EngineError;
use crate::policy::{RateLimiterConfig, RetryConfig};

/// Configuration for one engine run.
///
/// Every field has a default, so a config file only needs to name the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// JSON Lines input, one record per line.
    pub input_path: PathBuf,
    /// Successful results are appended here; also read back on restart to
    /// compute the completion set.
    pub output_path: PathBuf,
    /// Failure entries are appended here.
    pub error_path: PathBuf,
    /// Field holding each record's unique identity (e.g. `"id"`).
    pub id_key: String,
    /// Output field that, when truthy, forces the identity to be reprocessed.
    /// `None` disables forced reruns.
    pub rerun_key: Option<String>,
    /// Maximum transform invocations in flight at once.
    pub max_concurrency: usize,
    /// Start-of-work ceiling per minute. 0 disables rate limiting.
    pub requests_per_minute: u32,
    /// Successful results buffered before one batched append.
    pub write_batch_size: usize,
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds).
    pub retry_initial_delay_ms: u64,
    /// Upper bound on a single retry delay (milliseconds).
    pub retry_max_delay_ms: u64,
    /// Backoff multiplier applied per retry.
    pub retry_multiplier: f64,
    /// Random jitter as a fraction of the delay (0.1 = ±10%).
    pub retry_jitter: f64,
    /// Per-request timeout of the shared HTTP client (milliseconds).
    pub http_timeout_ms: u64,
    /// User-Agent header of the shared HTTP client.
    pub user_agent: String,
    /// How long in-flight records may keep running after cancellation or a
    /// fatal write error before they are aborted (milliseconds).
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_path: "data/input.jsonl".into(),
            output_path: "data/output.jsonl".into(),
            error_path: "data/error.jsonl".into(),
            id_key: "id".into(),
            rerun_key: Some("force_rerun".into()),
            max_concurrency: 100,
            requests_per_minute: 0,
            write_batch_size: 100,
            max_retries: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_multiplier: 2.0,
            retry_jitter: 0.1,
            http_timeout_ms: 30_000,
            user_agent: concat!("linebatch/", env!("CARGO_PKG_VERSION")).into(),
            shutdown_grace_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id_key.is_empty() {
            return Err(EngineError::Config("id_key must not be empty".into()));
        }
        if matches!(self.rerun_key.as_deref(), Some("")) {
            return Err(EngineError::Config(
                "rerun_key must not be empty (omit it to disable reruns)".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be at least 1".into()));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(EngineError::Config(format!(
                "max_concurrency must be at most {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_concurrency
            )));
        }
        if self.write_batch_size == 0 {
            return Err(EngineError::Config("write_batch_size must be at least 1".into()));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "retry_multiplier must be a finite number >= 1, got {}",
                self.retry_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(EngineError::Config(format!(
                "retry_jitter must be within [0, 1], got {}",
                self.retry_jitter
            )));
        }
        if self.input_path == self.output_path || self.input_path == self.error_path {
            return Err(EngineError::Config(
                "input_path must differ from output_path and error_path".into(),
            ));
        }
        if self.output_path == self.error_path {
            return Err(EngineError::Config(
                "output_path and error_path must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_initial_delay_ms),
            max_backoff: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
            jitter_fraction: self.retry_jitter,
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: self.requests_per_minute,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
