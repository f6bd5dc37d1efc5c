//! Redis connection shared by the default lock and bus

use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use std::sync::Arc;

use crate::bus::{MessageBus, RedisBus};
use crate::coordinator::config::ConfigError;
use crate::lock::{DistLock, RedisLock};
use crate::utils::retry::{with_retry, RetryConfig};

/// Default connection pool size
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Verified Redis connection
pub struct RedisBackend {
    client: redis::Client,
    pool: Pool,
}

impl RedisBackend {
    /// Open a pool on `url` and check it answers `PING`
    ///
    /// Connection attempts are retried per `retry`; every failure ends up as
    /// [`ConfigError::Unavailable`].
    pub async fn connect(url: &str, retry: &RetryConfig) -> Result<Self, ConfigError> {
        let unavailable = |reason: String| ConfigError::Unavailable {
            dependency: "redis".to_string(),
            reason,
        };

        let client = redis::Client::open(url).map_err(|e| unavailable(e.to_string()))?;

        let pool = PoolConfig::from_url(url)
            .builder()
            .map_err(|e| unavailable(format!("Failed to create pool builder: {e}")))?
            .max_size(DEFAULT_POOL_SIZE)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| unavailable(format!("Failed to create Redis connection pool: {e}")))?;

        with_retry(retry, "redis ping", || {
            let pool = pool.clone();
            async move {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| format!("Failed to get Redis connection: {e}"))?;
                let _: String = redis::cmd("PING")
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| format!("Failed to ping Redis: {e}"))?;
                Ok::<(), String>(())
            }
        })
        .await
        .map_err(unavailable)?;

        tracing::info!(url = %url, "Connected to Redis");

        Ok(Self { client, pool })
    }

    /// Lock backed by this connection
    pub fn lock(&self) -> Arc<dyn DistLock> {
        Arc::new(RedisLock::new(self.pool.clone()))
    }

    /// Message bus backed by this connection
    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::new(RedisBus::new(self.client.clone(), self.pool.clone()))
    }
}
