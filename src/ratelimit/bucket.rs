//! Token bucket refill and admission arithmetic.
//!
//! Everything here is pure: given the prior state and the current time it
//! computes the next state. Persisting that state atomically is the
//! limiter's job.

use std::time::Duration;

use super::state::BucketState;

/// Slack allowed when testing for a whole token.
///
/// Accrual is summed across many small committed steps, and the rounding of
/// each step must not leave an exactly-earned token just below 1.0.
pub const ADMISSION_TOLERANCE: f64 = 1e-9;

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    /// Maximum tokens a bucket can hold
    pub capacity: u64,
    /// Tokens accrued per elapsed second
    pub refill_rate_per_second: f64,
}

/// Outcome of applying one admission attempt to a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// Whether one token was consumed
    pub allowed: bool,
    /// State to persist
    pub next: BucketState,
}

impl BucketPolicy {
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_second,
        }
    }

    /// Balance after accruing refill from `state.last_refill_at_ms` to `now_ms`.
    ///
    /// Elapsed time is clamped at zero so a clock that moves backwards never
    /// removes tokens. Balances above capacity (e.g. written under a larger
    /// capacity) are clamped down.
    pub fn refilled(&self, state: &BucketState, now_ms: i64) -> f64 {
        let elapsed_secs = now_ms.saturating_sub(state.last_refill_at_ms).max(0) as f64 / 1000.0;
        let capacity = self.capacity as f64;
        (state.tokens + elapsed_secs * self.refill_rate_per_second).min(capacity)
    }

    /// Refill, then try to take one token.
    ///
    /// The returned state is written whether or not the attempt was admitted,
    /// so refill accrued up to `now_ms` is never counted twice.
    pub fn apply(&self, prior: &BucketState, now_ms: i64) -> Transition {
        let refilled = self.refilled(prior, now_ms);
        let allowed = refilled >= 1.0 - ADMISSION_TOLERANCE;
        let tokens = if allowed {
            (refilled - 1.0).max(0.0)
        } else {
            refilled
        };

        Transition {
            allowed,
            next: BucketState {
                tokens,
                last_refill_at_ms: now_ms.max(prior.last_refill_at_ms),
            },
        }
    }

    /// Time until a bucket holding `tokens` accrues a whole token.
    pub fn time_until_next_token(&self, tokens: f64) -> Duration {
        if tokens >= 1.0 - ADMISSION_TOLERANCE {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - tokens) / self.refill_rate_per_second)
    }
}
