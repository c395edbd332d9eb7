//! Token bucket accounting and the atomic update loop.

mod bucket;
mod limiter;
mod state;

pub use bucket::{BucketPolicy, Transition};
pub use limiter::{BucketSnapshot, Decision, LimiterConfig, TokenBucketLimiter, DEFAULT_MAX_RETRIES};
pub use state::{BucketState, StateKey, DEFAULT_KEY_PREFIX};
