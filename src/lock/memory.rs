//! Process-local TTL lock
//!
//! Clones share one table, so several coordinators in one process (or one
//! test) contend exactly as they would against Redis.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{new_token, DistLock, LockError, LockHandle};

#[derive(Debug)]
struct Entry {
    token: String,
    owner: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, Entry>,
    fences: HashMap<String, u64>,
}

/// In-memory lock shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    table: Arc<Mutex<Table>>,
}

impl MemoryLock {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Current non-expired owner of `resource`
    pub async fn holder(&self, resource: &str) -> Option<String> {
        let table = self.table.lock().await;
        table
            .entries
            .get(resource)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.owner.clone())
    }

    /// Drop the entry for `resource` as if its TTL had lapsed
    pub async fn expire(&self, resource: &str) {
        self.table.lock().await.entries.remove(resource);
    }
}

#[async_trait]
impl DistLock for MemoryLock {
    async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockHandle, LockError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;

        if let Some(entry) = table.entries.get(resource) {
            if entry.expires_at > now {
                return Err(LockError::Contended {
                    resource: resource.to_string(),
                });
            }
        }

        let token = new_token();
        table.entries.insert(
            resource.to_string(),
            Entry {
                token: token.clone(),
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );

        let fence = table.fences.entry(resource.to_string()).or_insert(0);
        *fence += 1;

        Ok(LockHandle::new(resource, owner, token, *fence, ttl, now))
    }

    async fn renew(&self, handle: &LockHandle) -> Result<LockHandle, LockError> {
        let now = Instant::now();
        let mut table = self.table.lock().await;

        match table.entries.get_mut(&handle.resource) {
            Some(entry) if entry.token == handle.token && entry.expires_at > now => {
                entry.expires_at = now + handle.ttl;
                Ok(handle.refreshed(now))
            }
            _ => Err(LockError::Lost {
                resource: handle.resource.clone(),
            }),
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let mut table = self.table.lock().await;

        match table.entries.get(&handle.resource) {
            Some(entry) if entry.token == handle.token => {
                table.entries.remove(&handle.resource);
                Ok(())
            }
            _ => Err(LockError::Lost {
                resource: handle.resource.clone(),
            }),
        }
    }
}
