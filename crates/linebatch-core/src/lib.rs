//! linebatch-core: resumable batch engine for JSON Lines record streams.
//!
//! # Overview
//!
//! The caller supplies a transformation (call an API, write to a database,
//! compute an embedding); the engine owns everything around it:
//!
//! ```text
//! Engine::run
//!   ├── Lifecycle      (shared HTTP client, startup/shutdown hooks)
//!   ├── ResumeTracker  (completion set from prior output)
//!   ├── WorkerPool     (input order, RateLimiter → Semaphore → spawn)
//!   │     └── RetryPolicy (exponential backoff + jitter per record)
//!   ├── ResultSink     (batched output, immediate error log)
//!   └── RunReporter    (counters, progress callback, final summary)
//! ```
//!
//! - [`Engine`]: the entry point, built from an [`EngineConfig`] and [`Hooks`]
//! - [`Context`]: shared resources handed to every transform call
//! - [`Outcome`] / [`Disposition`]: tagged per-record results
//! - [`policy`] module: rate limiter and retry policy, usable on their own

pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod jsonl;
pub mod lifecycle;
pub mod policy;
pub mod pool;
pub mod record;
pub mod report;
pub mod resume;
pub mod sink;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, HookError, TaskError};
pub use hooks::{Context, Hooks, ResourceMap};
pub use policy::{RateLimiter, RateLimiterConfig, Retryable, RetryConfig, RetryPolicy};
pub use record::{Disposition, Failure, Identity, IdentityKind, Outcome, Record};
pub use report::{RunSummary, StatsSnapshot};
pub use resume::{Decision, ResumeTracker, ScanReport};
pub use sink::{FailureEntry, ResultSink};

/// Re-exported so callers can build a token without depending on tokio-util.
pub use tokio_util::sync::CancellationToken;
