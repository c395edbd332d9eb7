//! Shared bucket state storage.
//!
//! The limiter keeps no client state in process memory. Every bucket lives in
//! a [`BucketStateStore`], which any number of processes may address at the
//! same time. The only write primitive the core relies on is a conditional
//! compare-and-swap over a single key.

mod clock;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Errors raised by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("backend error: {0}")]
    Backend(String),
}

/// Capability set over a shared, concurrently mutated key-value medium.
#[async_trait]
pub trait BucketStateStore: Send + Sync {
    /// Current time in milliseconds since the epoch.
    ///
    /// Every process sharing the store must see a clock close enough to the
    /// others for elapsed-time arithmetic to be meaningful.
    async fn now_ms(&self) -> Result<i64, StoreError>;

    /// Read the raw value stored under `key`.
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replace the value under `key` with `new_value` only if it still equals
    /// `expected` (`None` meaning the key must be absent).
    ///
    /// Returns `Ok(false)` without side effects when the condition fails.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StoreError>;
}
