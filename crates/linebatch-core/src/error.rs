//! Engine, hook and per-record error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that terminate a run.
///
/// Per-record problems never surface here; they become failure entries in the
/// error log (see [`TaskError`]).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected by [`crate::EngineConfig::validate`].
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The caller's startup hook failed; no record was processed.
    #[error("startup hook failed: {0}")]
    Startup(#[source] HookError),

    /// The shared HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The input or prior output could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output or error log could not be written. Always fatal: continuing
    /// would silently lose results.
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A result could not be encoded as JSON.
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    /// A worker task ended abnormally outside the transform boundary.
    #[error("worker task failed: {0}")]
    Join(String),
}

impl EngineError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

/// Failure raised by a caller's startup or shutdown hook.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HookError(String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for HookError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<reqwest::Error> for HookError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Errors produced while processing a single record.
///
/// The engine converts every one of these into a failure entry; none of them
/// ends the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Generic transient failure raised by the transform.
    #[error("{0}")]
    Failed(String),

    /// HTTP transport or status error (connection refused, 5xx, 429, ...).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A response or payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Failure that retrying cannot fix (bad request, validation error).
    #[error("{0}")]
    Permanent(String),

    /// The transform panicked; the panic was contained to this record.
    #[error("transform panicked: {0}")]
    Panicked(String),

    /// The record's identity value cannot be used for deduplication.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

impl TaskError {
    /// Shorthand for a retryable [`TaskError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Shorthand for a non-retryable [`TaskError::Permanent`].
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Stable machine-readable kind, written as `error_kind` in the error log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Http(_) => "http",
            Self::Timeout(_) => "timeout",
            Self::Decode(_) => "decode",
            Self::Permanent(_) => "permanent",
            Self::Panicked(_) => "panic",
            Self::InvalidIdentity(_) => "invalid_identity",
        }
    }

    /// Returns `true` if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Http(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
