//! Redis-backed window store using sorted sets.
//!
//! Each key is a sorted set whose members are scored by their timestamp in
//! epoch milliseconds. A check runs as one `MULTI/EXEC` pipeline so no other
//! client can interleave between the count and the insert.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use tracing::{info, trace};

use crate::error::StoreError;
use crate::ratelimit::clock::duration_ms;
use crate::ratelimit::{WindowEntry, WindowStore};

const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local window_start = ARGV[1]
local at_ms = ARGV[2]
local member = ARGV[3]
local max = tonumber(ARGV[4])
local window_ms = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. window_start)
local count = redis.call('ZCARD', key)

if count < max then
  redis.call('ZADD', key, at_ms, member)
  redis.call('PEXPIRE', key, window_ms)
end

return count
"#;

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Upper bound on establishing the connection
    pub connect_timeout: Duration,
    /// Upper bound on every individual store call
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(250),
        }
    }
}

/// Shared [`WindowStore`] for limits enforced across service instances.
///
/// The connection manager reconnects on its own; calls made while Redis is
/// down fail with a [`StoreError`] once the command timeout elapses.
pub struct RedisStore {
    conn: ConnectionManager,
    config: RedisStoreConfig,
    admit_script: Script,
}

impl RedisStore {
    /// Connect to Redis.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;

        // Bound the connect so an unreachable server cannot stall startup.
        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout))??;

        info!(url = %config.url, "Connected to Redis window store");

        Ok(Self {
            conn,
            config,
            admit_script: Script::new(ADMIT_SCRIPT),
        })
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = self.run(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }

    async fn run<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.config.command_timeout)),
        }
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn purge_count_insert(
        &self,
        key: &str,
        entry: &WindowEntry,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let window_ms = duration_ms(window);
        let window_start = entry.at_ms.saturating_sub(window_ms);
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", window_start))
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZADD")
            .arg(key)
            .arg(entry.at_ms)
            .arg(&entry.member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms)
            .ignore();

        let (count,): (u64,) = self.run(pipe.query_async(&mut conn)).await?;

        trace!(key = %key, count = count, "Redis window updated");
        Ok(count)
    }

    async fn purge_count_admit(
        &self,
        key: &str,
        entry: &WindowEntry,
        window: Duration,
        max: u64,
    ) -> Result<u64, StoreError> {
        let window_ms = duration_ms(window);
        let window_start = entry.at_ms.saturating_sub(window_ms);
        let mut conn = self.conn.clone();

        let count: u64 = self
            .run(
                self.admit_script
                    .key(key)
                    .arg(window_start)
                    .arg(entry.at_ms)
                    .arg(&entry.member)
                    .arg(max)
                    .arg(window_ms)
                    .invoke_async(&mut conn),
            )
            .await?;

        trace!(key = %key, count = count, "Redis window checked");
        Ok(count)
    }

    async fn retract(&self, key: &str, entry: &WindowEntry) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .run(
                redis::cmd("ZREM")
                    .arg(key)
                    .arg(&entry.member)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(removed > 0)
    }

    async fn live_entries(&self, key: &str, window_start_ms: i64) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let scored: Vec<(String, f64)> = self
            .run(
                redis::cmd("ZRANGEBYSCORE")
                    .arg(key)
                    .arg(window_start_ms)
                    .arg("+inf")
                    .arg("WITHSCORES")
                    .query_async(&mut conn),
            )
            .await?;

        // Scores are whole milliseconds, well inside f64's exact range.
        Ok(scored.into_iter().map(|(_, score)| score as i64).collect())
    }

    async fn clear(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let removed: u64 = self
            .run(redis::cmd("DEL").arg(keys).query_async(&mut conn))
            .await?;
        Ok(removed)
    }
}
