use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use tianyi_core::config::CACHE_OP_TIMEOUT_MS;

use crate::error::{Result, StoreError};

/// Optimistic-lock attempts before a cache update is dropped. The durable
/// log stays authoritative; the next prefill rebuilds the key.
const CAS_MAX_ATTEMPTS: u32 = 3;
const CAS_BACKOFF_BASE_MS: u64 = 20;

pub fn context_key(user_id: &str) -> String {
    format!("user_context:{user_id}")
}
pub fn knowledge_key(user_id: &str) -> String {
    format!("user_knowledge:{user_id}")
}
pub fn nickname_key(user_id: &str) -> String {
    format!("user_nickname:{user_id}")
}
pub fn recent_update_key(user_id: &str) -> String {
    format!("user_recent_memory_update:{user_id}")
}
pub fn used_uuid_key(user_id: &str) -> String {
    format!("user_used_uuid:{user_id}")
}

/// Shared process-external cache holding each user's working set.
///
/// Plain reads and TTL writes go through a multiplexed connection manager.
/// Compare-and-set sequences open a dedicated connection because WATCH
/// state is per-connection.
#[derive(Clone)]
pub struct HotCache {
    client: redis::Client,
    manager: ConnectionManager,
    ttl_secs: u64,
}

impl HotCache {
    pub async fn connect(url: &str, ttl_secs: u64) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            manager,
            ttl_secs,
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        let mut cmd = redis::cmd("GET");
        let fut = cmd.arg(key).query_async::<_, Option<String>>(&mut con);
        with_deadline(fut).await
    }

    /// SETEX with the configured TTL.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let mut cmd = redis::cmd("SETEX");
        let fut = cmd
            .arg(key)
            .arg(self.ttl_secs)
            .arg(value)
            .query_async::<_, ()>(&mut con);
        with_deadline(fut).await
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let mut cmd = redis::cmd("DEL");
        let fut = cmd.arg(key).query_async::<_, ()>(&mut con);
        with_deadline(fut).await
    }

    /// Optimistic-lock read-modify-write on one key.
    ///
    /// `modify` receives the current value and returns the replacement, or
    /// `None` to leave the key untouched (also the path taken when the key
    /// is absent and nothing should be created). Returns `true` when the
    /// update committed or was a no-op, `false` when all attempts lost the
    /// race and the update was dropped.
    pub async fn update_watched<F>(&self, key: &str, modify: F) -> Result<bool>
    where
        F: Fn(Option<String>) -> Option<String>,
    {
        for attempt in 0..CAS_MAX_ATTEMPTS {
            let mut con = self.client.get_multiplexed_async_connection().await?;
            with_deadline(redis::cmd("WATCH").arg(key).query_async::<_, ()>(&mut con)).await?;
            let current: Option<String> =
                with_deadline(redis::cmd("GET").arg(key).query_async(&mut con)).await?;

            let Some(next) = modify(current) else {
                let _ = redis::cmd("UNWATCH").query_async::<_, ()>(&mut con).await;
                return Ok(true);
            };

            // EXEC returns nil when the watched key changed under us.
            let committed: Option<(String,)> = with_deadline(
                redis::pipe()
                    .atomic()
                    .cmd("SETEX")
                    .arg(key)
                    .arg(self.ttl_secs)
                    .arg(&next)
                    .ignore()
                    .cmd("GET")
                    .arg(key)
                    .query_async(&mut con),
            )
            .await?;

            if committed.is_some() {
                return Ok(true);
            }
            debug!(key, attempt, "optimistic lock lost, retrying");
            tokio::time::sleep(Duration::from_millis(backoff_jitter_ms(attempt))).await;
        }
        warn!(key, "optimistic update dropped after {CAS_MAX_ATTEMPTS} attempts");
        Ok(false)
    }
}

/// Factor-2 backoff, jittered with the clock's sub-millisecond noise.
fn backoff_jitter_ms(attempt: u32) -> u64 {
    let base = CAS_BACKOFF_BASE_MS << attempt;
    let noise = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0);
    base + noise % base.max(1)
}

async fn with_deadline<T>(
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T> {
    match tokio::time::timeout(Duration::from_millis(CACHE_OP_TIMEOUT_MS), fut).await {
        Ok(res) => res.map_err(StoreError::Cache),
        Err(_) => Err(StoreError::CacheTimeout),
    }
}
