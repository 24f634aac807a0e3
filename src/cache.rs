use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterOutcome {
    pub allowed: bool,
    pub new_total: f64,
}

/// Key/value collaborator backing the stage ledger, the read-model cache and
/// the spend counter. Reads and writes are best-effort (the ledger is an
/// accelerator, not a source of truth); only `incr_if_under` reports backend
/// failure, because the spend guard must not silently admit offers.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_json(&self, key: &str) -> Option<Value>;
    async fn set_json(&self, key: &str, value: Value, ttl_secs: u64);
    async fn del(&self, key: &str);

    /// Atomically add `amount` to the counter at `key` only if the
    /// post-increment total stays at or under `ceiling`. On `allowed:
    /// false` the counter is unchanged. One read-modify-write step; two
    /// concurrent callers can never jointly exceed the ceiling.
    async fn incr_if_under(
        &self,
        key: &str,
        amount: f64,
        ceiling: f64,
        ttl_secs: u64,
    ) -> Result<CounterOutcome, CacheError>;
}

// ---- In-memory implementation ----

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, (Value, Instant)>,
    counters: HashMap<String, (f64, Instant)>,
}

/// Process-local cache used in tests and when `REDIS_URL` is not set.
/// Atomicity of `incr_if_under` comes from holding the map lock across the
/// whole read-modify-write.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<MemoryInner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_json(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().await;
        match inner.entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set_json(&self, key: &str, value: Value, ttl_secs: u64) {
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        self.inner
            .lock()
            .await
            .entries
            .insert(key.to_string(), (value, expires));
    }

    async fn del(&self, key: &str) {
        self.inner.lock().await.entries.remove(key);
    }

    async fn incr_if_under(
        &self,
        key: &str,
        amount: f64,
        ceiling: f64,
        ttl_secs: u64,
    ) -> Result<CounterOutcome, CacheError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let current = match inner.counters.get(key) {
            Some((total, expires)) if *expires > now => *total,
            _ => 0.0,
        };
        if current + amount > ceiling {
            return Ok(CounterOutcome {
                allowed: false,
                new_total: current,
            });
        }
        let new_total = current + amount;
        let expires = match inner.counters.get(key) {
            Some((_, expires)) if *expires > now => *expires,
            _ => now + Duration::from_secs(ttl_secs),
        };
        inner.counters.insert(key.to_string(), (new_total, expires));
        Ok(CounterOutcome {
            allowed: true,
            new_total,
        })
    }
}

// ---- Redis implementation ----

/// Check-and-increment as one server-side script so the comparison and the
/// INCRBYFLOAT cannot interleave with another caller.
static INCR_IF_UNDER: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        local total = tonumber(redis.call('GET', KEYS[1]) or '0')
        local amount = tonumber(ARGV[1])
        local ceiling = tonumber(ARGV[2])
        if total + amount > ceiling then
            return {0, tostring(total)}
        end
        local new = redis.call('INCRBYFLOAT', KEYS[1], amount)
        if redis.call('TTL', KEYS[1]) < 0 then
            redis.call('EXPIRE', KEYS[1], ARGV[3])
        end
        return {1, new}
        "#,
    )
});

pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn from_env() -> Option<Self> {
        let url = std::env::var("REDIS_URL").ok()?;
        match redis::Client::open(url) {
            Ok(client) => Some(Self { client }),
            Err(err) => {
                warn!(target = "pawnshop.cache", error = %err, "invalid REDIS_URL, falling back to memory cache");
                None
            }
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_json(&self, key: &str) -> Option<Value> {
        let mut conn = self.client.get_multiplexed_async_connection().await.ok()?;
        let raw: Option<String> = conn.get(key).await.ok()?;
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    async fn set_json(&self, key: &str, value: Value, ttl_secs: u64) {
        if let Ok(mut conn) = self.client.get_multiplexed_async_connection().await
            && let Ok(json) = serde_json::to_string(&value)
        {
            let result: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
            if let Err(err) = result {
                warn!(target = "pawnshop.cache", key, error = %err, "cache write failed");
            }
        }
    }

    async fn del(&self, key: &str) {
        if let Ok(mut conn) = self.client.get_multiplexed_async_connection().await {
            let _: Result<(), _> = conn.del(key).await;
        }
    }

    async fn incr_if_under(
        &self,
        key: &str,
        amount: f64,
        ceiling: f64,
        ttl_secs: u64,
    ) -> Result<CounterOutcome, CacheError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CacheError::Backend(err.to_string()))?;
        let (flag, total): (i64, String) = INCR_IF_UNDER
            .key(key)
            .arg(amount)
            .arg(ceiling)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| CacheError::Backend(err.to_string()))?;
        let new_total = total
            .parse::<f64>()
            .map_err(|err| CacheError::Backend(err.to_string()))?;
        Ok(CounterOutcome {
            allowed: flag == 1,
            new_total,
        })
    }
}
