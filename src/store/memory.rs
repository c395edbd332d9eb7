//! In-memory bucket state store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::{BucketStateStore, StoreError};

/// A shared in-memory store.
///
/// Cloning a `MemoryStore` yields another handle onto the same entries, so
/// independent limiters built over clones contend for state exactly as
/// separate processes would over an external store. The compare-and-swap
/// holds the entry's shard lock for the duration of the comparison and write.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Create an empty store driven by the given clock.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock: Arc::new(clock),
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Overwrite an entry unconditionally.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStateStore for MemoryStore {
    async fn now_ms(&self) -> Result<i64, StoreError> {
        Ok(self.clock.now_millis())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        let applied = match (self.entries.entry(key.to_string()), expected) {
            (Entry::Vacant(slot), None) => {
                slot.insert(new_value.to_string());
                true
            }
            (Entry::Occupied(mut slot), Some(expected)) if slot.get() == expected => {
                slot.insert(new_value.to_string());
                true
            }
            _ => false,
        };

        trace!(key = %key, applied, "compare_and_swap");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ManualClock;

    #[tokio::test]
    async fn test_read_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cas_creates_only_when_absent() {
        let store = MemoryStore::new();

        assert!(store.compare_and_swap("k", None, "a").await.unwrap());
        assert!(!store.compare_and_swap("k", None, "b").await.unwrap());
        assert_eq!(store.read("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_cas_requires_matching_prior() {
        let store = MemoryStore::new();
        store.insert("k", "a");

        assert!(!store.compare_and_swap("k", Some("stale"), "b").await.unwrap());
        assert_eq!(store.read("k").await.unwrap().as_deref(), Some("a"));

        assert!(store.compare_and_swap("k", Some("a"), "b").await.unwrap());
        assert_eq!(store.read("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_cas_expected_value_on_missing_key_fails() {
        let store = MemoryStore::new();

        assert!(!store.compare_and_swap("k", Some("a"), "b").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = MemoryStore::new();
        let other = store.clone();

        store.insert("k", "v");
        assert_eq!(other.read("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(other.len(), 1);

        other.clear();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_now_uses_configured_clock() {
        let clock = ManualClock::new(42);
        let store = MemoryStore::with_clock(clock.clone());

        assert_eq!(store.now_ms().await.unwrap(), 42);
        clock.set(43);
        assert_eq!(store.now_ms().await.unwrap(), 43);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cas_single_winner() {
        let store = MemoryStore::new();

        let attempts: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .compare_and_swap("k", None, &i.to_string())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let winners = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }
}
