//! Turnstile - Distributed Token Bucket Admission Control
//!
//! This crate decides whether a client may perform one unit of work under a
//! rate budget shared by every process that calls it. Bucket state lives in an
//! external store and is only ever changed through a conditional
//! compare-and-swap, so concurrent callers cannot over-admit.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{Result, TurnstileError};
pub use ratelimit::{Decision, LimiterConfig, TokenBucketLimiter};
pub use store::{BucketStateStore, MemoryStore};
