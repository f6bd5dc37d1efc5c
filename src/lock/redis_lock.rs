//! Redis-backed TTL lock
//!
//! Ownership is a random token stored under the resource key with `SET NX PX`.
//! Renew and release are Lua scripts that compare the token first, so a
//! process whose lock expired can never extend or delete its successor's key.
//! A counter under `{resource}:fence` is incremented on every successful
//! acquire and handed out as the fencing token.

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Script;
use std::time::{Duration, Instant};

use super::{new_token, DistLock, LockError, LockHandle};

const ACQUIRE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return redis.call('INCR', KEYS[2])
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Distributed lock stored in Redis
pub struct RedisLock {
    pool: Pool,
    acquire: Script,
    renew: Script,
    release: Script,
}

impl RedisLock {
    /// Create a lock client on an existing connection pool
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            acquire: Script::new(ACQUIRE_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn fence_key(resource: &str) -> String {
        format!("{resource}:fence")
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, LockError> {
        self.pool
            .get()
            .await
            .map_err(|e| LockError::Transport(format!("pool: {e}")))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl DistLock for RedisLock {
    async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockHandle, LockError> {
        let mut conn = self.connection().await?;
        let token = new_token();
        let sent_at = Instant::now();

        let fence: i64 = self
            .acquire
            .key(resource)
            .key(Self::fence_key(resource))
            .arg(&token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| LockError::Transport(e.to_string()))?;

        if fence <= 0 {
            return Err(LockError::Contended {
                resource: resource.to_string(),
            });
        }

        tracing::debug!(resource = %resource, owner = %owner, fence, "Redis lock acquired");
        Ok(LockHandle::new(
            resource,
            owner,
            token,
            fence as u64,
            ttl,
            sent_at,
        ))
    }

    async fn renew(&self, handle: &LockHandle) -> Result<LockHandle, LockError> {
        let mut conn = self.connection().await?;
        let sent_at = Instant::now();

        let extended: i64 = self
            .renew
            .key(&handle.resource)
            .arg(&handle.token)
            .arg(ttl_millis(handle.ttl))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| LockError::Transport(e.to_string()))?;

        if extended == 1 {
            Ok(handle.refreshed(sent_at))
        } else {
            Err(LockError::Lost {
                resource: handle.resource.clone(),
            })
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let mut conn = self.connection().await?;

        let deleted: i64 = self
            .release
            .key(&handle.resource)
            .arg(&handle.token)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| LockError::Transport(e.to_string()))?;

        if deleted == 1 {
            Ok(())
        } else {
            Err(LockError::Lost {
                resource: handle.resource.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_key() {
        assert_eq!(
            RedisLock::fence_key("kettle-distlocker"),
            "kettle-distlocker:fence"
        );
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_secs(29)), 29_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[test]
    fn test_scripts_compare_token_before_mutating() {
        assert!(RENEW_SCRIPT.contains("GET"));
        assert!(RELEASE_SCRIPT.contains("GET"));
        assert!(ACQUIRE_SCRIPT.contains("NX"));
    }
}
