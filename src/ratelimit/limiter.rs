//! Token bucket limiter over a shared state store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use super::bucket::BucketPolicy;
use super::state::{BucketState, StateKey, DEFAULT_KEY_PREFIX};
use crate::error::{Result, TurnstileError};
use crate::store::BucketStateStore;

/// Default bound on optimistic-conflict retries per call.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Construction parameters for a [`TokenBucketLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Maximum tokens a client's bucket can hold
    pub capacity: u64,
    /// Tokens added per elapsed second
    pub refill_rate_per_second: f64,
    /// How many times to retry after losing a compare-and-swap race
    pub max_retries: u32,
    /// Namespace for state keys
    pub key_prefix: String,
}

impl LimiterConfig {
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_second,
            max_retries: DEFAULT_MAX_RETRIES,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// Reject parameters that cannot describe a working bucket.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "capacity must be positive".to_string(),
            ));
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err(TurnstileError::InvalidConfiguration(format!(
                "refill rate must be a positive number, got {}",
                self.refill_rate_per_second
            )));
        }
        if self.max_retries == 0 {
            return Err(TurnstileError::InvalidConfiguration(
                "max_retries must be positive".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(TurnstileError::InvalidConfiguration(
                "key prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether a token was consumed
    pub allowed: bool,
    /// Tokens left in the bucket after this attempt
    pub remaining: f64,
    /// Time until the bucket holds a whole token again
    pub retry_after: Duration,
}

/// Read-only view of a client's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    /// Balance including refill accrued up to the time of the read
    pub tokens: f64,
    pub capacity: u64,
    /// Timestamp of the last committed update
    pub last_refill_at_ms: i64,
}

/// A distributed token bucket limiter.
///
/// The limiter holds no per-client state: buckets live in the store, and every
/// decision is committed with a compare-and-swap against the exact value that
/// was read. A lost race means another caller committed first, so the whole
/// read-refill-decide cycle runs again on fresh state. Instances are cheap and
/// any number of them, in any number of processes, may share one store.
pub struct TokenBucketLimiter<S: ?Sized> {
    store: Arc<S>,
    policy: BucketPolicy,
    max_retries: u32,
    key_prefix: String,
}

impl<S: ?Sized> Clone for TokenBucketLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy,
            max_retries: self.max_retries,
            key_prefix: self.key_prefix.clone(),
        }
    }
}

impl<S: BucketStateStore + ?Sized> TokenBucketLimiter<S> {
    /// Create a limiter over `store`, validating `config` eagerly.
    pub fn new(store: Arc<S>, config: LimiterConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            capacity = config.capacity,
            refill_rate_per_second = config.refill_rate_per_second,
            max_retries = config.max_retries,
            key_prefix = %config.key_prefix,
            "Creating token bucket limiter"
        );

        Ok(Self {
            store,
            policy: BucketPolicy::new(config.capacity, config.refill_rate_per_second),
            max_retries: config.max_retries,
            key_prefix: config.key_prefix,
        })
    }

    /// Whether `client_id` may perform one unit of work now.
    ///
    /// On `Ok(true)` exactly one token has been durably consumed.
    pub async fn is_allowed(&self, client_id: &str) -> Result<bool> {
        self.check(client_id).await.map(|decision| decision.allowed)
    }

    /// Attempt to consume one token, reporting the resulting balance.
    #[instrument(skip(self), level = "debug")]
    pub async fn check(&self, client_id: &str) -> Result<Decision> {
        let key = self.state_key(client_id)?;
        let mut conflicts = 0u32;

        loop {
            let raw = self.store.read(&key).await?;
            let now_ms = self.store.now_ms().await?;

            let prior = match raw.as_deref() {
                Some(raw) => self.decode(&key, raw)?,
                None => BucketState::full(self.policy.capacity, now_ms),
            };
            let transition = self.policy.apply(&prior, now_ms);
            let encoded = transition
                .next
                .encode()
                .map_err(|reason| TurnstileError::CorruptState {
                    key: key.clone(),
                    reason,
                })?;

            trace!(
                key = %key,
                prior_tokens = prior.tokens,
                next_tokens = transition.next.tokens,
                allowed = transition.allowed,
                attempt = conflicts + 1,
                "Committing bucket update"
            );

            let committed = self
                .store
                .compare_and_swap(&key, raw.as_deref(), &encoded)
                .await?;

            if committed {
                if !transition.allowed {
                    debug!(key = %key, tokens = transition.next.tokens, "Rate limit exceeded");
                }
                return Ok(Decision {
                    allowed: transition.allowed,
                    remaining: transition.next.tokens,
                    retry_after: self.policy.time_until_next_token(transition.next.tokens),
                });
            }

            conflicts += 1;
            if conflicts > self.max_retries {
                warn!(
                    key = %key,
                    conflicts,
                    "Giving up after repeated concurrent updates"
                );
                return Err(TurnstileError::Contention {
                    client_id: client_id.to_string(),
                    attempts: conflicts,
                });
            }

            debug!(key = %key, conflicts, "Bucket changed concurrently, retrying");
            tokio::task::yield_now().await;
        }
    }

    /// Current balance for `client_id` without consuming or writing anything.
    ///
    /// Returns `None` for a client that has never been seen.
    pub async fn peek(&self, client_id: &str) -> Result<Option<BucketSnapshot>> {
        let key = self.state_key(client_id)?;
        let Some(raw) = self.store.read(&key).await? else {
            return Ok(None);
        };
        let state = self.decode(&key, &raw)?;
        let now_ms = self.store.now_ms().await?;

        Ok(Some(BucketSnapshot {
            tokens: self.policy.refilled(&state, now_ms),
            capacity: self.policy.capacity,
            last_refill_at_ms: state.last_refill_at_ms,
        }))
    }

    /// Capacity and refill rate in effect.
    pub fn policy(&self) -> BucketPolicy {
        self.policy
    }

    /// The store this limiter commits to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn state_key(&self, client_id: &str) -> Result<String> {
        if client_id.is_empty() {
            return Err(TurnstileError::InvalidClientId);
        }
        Ok(StateKey::new(&self.key_prefix, client_id).to_store_key())
    }

    fn decode(&self, key: &str, raw: &str) -> Result<BucketState> {
        BucketState::decode(raw).map_err(|reason| {
            warn!(key = %key, reason = %reason, "Undecodable bucket state");
            TurnstileError::CorruptState {
                key: key.to_string(),
                reason,
            }
        })
    }
}
