//! Redis-backed [`CounterStore`].
//!
//! The check, the increment and the expiry are one Lua script, so concurrent
//! requests for the same key can never over-admit.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::Script;

use super::counter::{CounterStore, WindowPolicy};
use super::StoreError;

/// Lua script for an atomic bounded increment.
///
/// KEYS\[1\] = counter key
/// ARGV\[1\] = limit
/// ARGV\[2\] = window in milliseconds
/// ARGV\[3\] = 1 to re-arm the expiry on every increment, 0 to arm it once
///
/// Returns 1 if the counter was incremented, 0 if the limit was reached.
const CHECK_AND_INCREMENT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return 0
end
local count = redis.call('INCR', KEYS[1])
if ARGV[3] == '1' or count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
";

#[derive(Debug, Clone)]
pub struct RedisCounterConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`).
    pub url: String,
    pub pool_size: usize,
    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,
}

impl Default for RedisCounterConfig {
    fn default() -> Self {
        Self {
            url: String::from("redis://127.0.0.1:6379"),
            pool_size: 16,
            connection_timeout: Duration::from_secs(2),
        }
    }
}

pub struct RedisCounterStore {
    pool: Pool,
    script: Script,
}

impl RedisCounterStore {
    /// Build the connection pool. No connection is opened until first use.
    pub fn new(config: &RedisCounterConfig) -> Result<Self, StoreError> {
        let pool = Config::from_url(&config.url)
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .create_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            script: Script::new(CHECK_AND_INCREMENT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        policy: WindowPolicy,
    ) -> Result<bool, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let refresh = if policy == WindowPolicy::Refresh { 1 } else { 0 };

        let admitted: i64 = self
            .script
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .arg(refresh)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    StoreError::Unavailable(e.to_string())
                } else {
                    StoreError::Backend(e.to_string())
                }
            })?;

        Ok(admitted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = RedisCounterConfig::default();
        assert_eq!(cfg.url, "redis://127.0.0.1:6379");
        assert_eq!(cfg.pool_size, 16);
    }

    #[test]
    fn test_pool_creation_is_lazy() {
        // Nothing listens here; building the pool must still succeed.
        let cfg = RedisCounterConfig {
            url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        assert!(RedisCounterStore::new(&cfg).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_redis_reports_unavailable() {
        let cfg = RedisCounterConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let store = RedisCounterStore::new(&cfg).unwrap();
        let result = store
            .check_and_increment("ratelimit:test", 10, Duration::from_secs(60), WindowPolicy::Fixed)
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
