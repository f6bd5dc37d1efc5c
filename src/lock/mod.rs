//! Distributed mutual-exclusion lock
//!
//! The [`DistLock`] capability is what the election loop contends on. A
//! successful acquire is exclusive across every process contending for the
//! same resource name and expires on its own after the TTL unless renewed.
//!
//! Two implementations ship with the crate:
//!
//! - [`RedisLock`] - `SET NX PX` with Lua compare-and-renew / compare-and-delete
//! - [`MemoryLock`] - a process-local table, shared between clones

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod memory;
pub mod redis_lock;

pub use memory::MemoryLock;
pub use redis_lock::RedisLock;

/// Resource name the coordinators of one group contend on
pub fn resource_name(group: &str) -> String {
    format!("{group}-distlocker")
}

/// Generate a random ownership token
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Lock Handle
// ============================================================================

/// Proof of ownership of a lock resource
///
/// `expires_at` is computed from the instant the acquire or renew request was
/// sent, so the local view of the deadline is never later than the server's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Locked resource name
    pub resource: String,

    /// Instance id of the owner
    pub owner: String,

    /// Random value stored under the resource key
    pub token: String,

    /// Monotonically increasing per resource, assigned on acquire
    pub fencing_token: u64,

    /// Time-to-live requested on acquire
    pub ttl: Duration,

    /// Local monotonic deadline
    pub expires_at: Instant,
}

impl LockHandle {
    /// Create a handle for a lock granted to a request sent at `sent_at`
    pub fn new(
        resource: impl Into<String>,
        owner: impl Into<String>,
        token: impl Into<String>,
        fencing_token: u64,
        ttl: Duration,
        sent_at: Instant,
    ) -> Self {
        Self {
            resource: resource.into(),
            owner: owner.into(),
            token: token.into(),
            fencing_token,
            ttl,
            expires_at: sent_at + ttl,
        }
    }

    /// Same ownership with a deadline extended from `sent_at`
    pub fn refreshed(&self, sent_at: Instant) -> Self {
        Self {
            expires_at: sent_at + self.ttl,
            ..self.clone()
        }
    }

    /// Check if the local deadline has passed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before the local deadline
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Lock acquire/renew/release failures
///
/// None of these are fatal. The election loop maps every variant to "not
/// holding the lock".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// Another owner holds the resource
    #[error("lock '{resource}' is held by another owner")]
    Contended { resource: String },

    /// The handle no longer owns the resource (expired or taken over)
    #[error("lock '{resource}' is no longer owned by this handle")]
    Lost { resource: String },

    /// The backing store could not be reached
    #[error("lock transport failure: {0}")]
    Transport(String),

    /// The operation did not finish in time
    #[error("lock operation timed out")]
    Timeout,
}

// ============================================================================
// Capability
// ============================================================================

/// Distributed TTL lock
#[async_trait]
pub trait DistLock: Send + Sync {
    /// Try once to take `resource` for `ttl` on behalf of `owner`
    async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockHandle, LockError>;

    /// Extend the lock held by `handle` by its TTL
    async fn renew(&self, handle: &LockHandle) -> Result<LockHandle, LockError>;

    /// Give up the lock held by `handle`
    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
}
