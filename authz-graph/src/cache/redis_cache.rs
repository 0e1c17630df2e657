//! Redis cache provider
//!
//! Shared by every process serving the tenant, so invalidation is visible
//! across the fleet. Uses a multiplexed `ConnectionManager` that reconnects
//! on its own; each call clones the handle.

use crate::cache::CacheProvider;
use crate::error::{GraphError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info};

/// Swap a value only while it still holds the caller's sentinel
const COMPARE_AND_SET_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

const SCAN_BATCH: usize = 500;

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so a key prefix only ever matches literally
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct RedisCache {
    redis: ConnectionManager,
    cas_script: redis::Script,
}

impl RedisCache {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GraphError::CacheError(format!("Failed to create Redis client: {}", e)))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| GraphError::CacheError(format!("Failed to connect to Redis: {}", e)))?;

        info!("Connected to Redis cache");
        Ok(Self {
            redis,
            cas_script: redis::Script::new(COMPARE_AND_SET_SCRIPT),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    /// All keys matching `prefix*`, walked with SCAN so Redis is never blocked
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

#[async_trait]
impl CacheProvider for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_set(&self, key: &str, expected: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.redis.clone();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn invalidate(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!("Deleted {} keys from Redis", keys.len());
        Ok(())
    }

    async fn flush(&self, prefix: &str) -> Result<u64> {
        let keys = self.scan_prefix(prefix).await?;
        let mut conn = self.redis.clone();
        let mut removed = 0u64;
        for chunk in keys.chunks(SCAN_BATCH) {
            let deleted: u64 = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
            removed += deleted;
        }
        Ok(removed)
    }

    async fn log_key_values(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut keys = self.scan_prefix(prefix).await?;
        keys.sort();
        keys.dedup();
        let mut conn = self.redis.clone();
        let mut out = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(SCAN_BATCH) {
            let values: Vec<Option<String>> = redis::cmd("MGET").arg(chunk).query_async(&mut conn).await?;
            out.extend(
                chunk
                    .iter()
                    .zip(values)
                    .filter_map(|(k, v)| v.map(|v| (k.clone(), v))),
            );
        }
        Ok(out)
    }
}
