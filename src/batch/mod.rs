//! Rate-limited batch processing outside the durable queue.

pub mod rate_limiter;
pub mod runner;

pub use rate_limiter::RateLimiter;
pub use runner::{
    BatchError, BatchJobResults, BatchJobStatus, BatchRunner, BatchStatus, ItemError,
    RateLimitConfig, ResultsQuery, DEFAULT_RESULTS_LIMIT,
};
