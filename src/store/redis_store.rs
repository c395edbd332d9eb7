//! Redis-backed bucket state store.
//!
//! Reads are a plain `GET`. The conditional write runs as a single Lua script
//! so the comparison and the `SET` are one indivisible server-side step. Time
//! comes from the Redis `TIME` command, which gives every process the same
//! clock regardless of local drift.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Script};
use tracing::{debug, info};

use super::{BucketStateStore, StoreError};

/// ARGV[1] = "1" when a prior value is expected, "0" when the key must be absent
/// ARGV[2] = expected prior value
/// ARGV[3] = new value
/// ARGV[4] = expiry in milliseconds, 0 for none
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Upper bound on every round-trip
    pub operation_timeout: Duration,
    /// Expire client state that has not been written for this long
    pub idle_ttl: Option<Duration>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            operation_timeout: Duration::from_millis(250),
            idle_ttl: None,
        }
    }
}

/// Bucket state store over a shared Redis instance.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    script: Script,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish()
    }
}

impl RedisStore {
    /// Open a multiplexed connection to Redis.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        info!(url = %config.url, "Connecting to Redis state store");

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let connection = with_timeout(
            "connect",
            config.operation_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await?;

        Ok(Self {
            connection,
            script: Script::new(COMPARE_AND_SWAP_SCRIPT),
            config,
        })
    }

    fn ttl_millis(&self) -> u64 {
        self.config
            .idle_ttl
            .map(|ttl| ttl.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl BucketStateStore for RedisStore {
    async fn now_ms(&self) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let (secs, micros): (i64, i64) = with_timeout(
            "TIME",
            self.config.operation_timeout,
            redis::cmd("TIME").query_async(&mut conn),
        )
        .await?;
        Ok(secs * 1000 + micros / 1000)
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        with_timeout(
            "GET",
            self.config.operation_timeout,
            redis::cmd("GET").arg(key).query_async(&mut conn),
        )
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.script.key(key);
        invocation
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(new_value)
            .arg(self.ttl_millis());

        let applied: i64 = with_timeout(
            "compare_and_swap",
            self.config.operation_timeout,
            invocation.invoke_async(&mut conn),
        )
        .await?;

        debug!(key = %key, applied = applied == 1, "Redis compare_and_swap");
        Ok(applied == 1)
    }
}

async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() => {
            Err(StoreError::Connection(e.to_string()))
        }
        Ok(Err(e)) => Err(StoreError::Backend(e.to_string())),
        Err(_) => Err(StoreError::Timeout { operation, timeout }),
    }
}
