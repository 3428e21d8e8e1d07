//! Policy engine: pacing and retry applied around every transform call.
//!
//! The policy stack (applied in order per record):
//! ```text
//! Record → [RateLimiter] → [capacity permit] → [RetryPolicy → transform]
//!                                                   └─ each retry re-enters RateLimiter
//! ```

pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{Attempted, Retryable, RetryConfig, RetryPolicy};
