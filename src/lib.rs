//! kettle - master election and worker coordination
//!
//! A group of coordinator processes contends for one distributed lock; the
//! holder is the master and broadcasts commands to a pool of workers over a
//! publish/subscribe bus, collecting their correlated responses.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`lock`] - Distributed TTL lock (Redis and in-memory)
//! - [`bus`] - Publish/subscribe transport (Redis and in-memory)
//! - [`protocol`] - Command/response messages and broadcast-then-collect
//! - [`coordinator`] - Election loop, worker registry, coordinator and status API
//! - [`worker`] - Worker side of the command protocol
//! - [`config`] - Process settings from environment or TOML
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kettle::bus::MemoryBus;
//! use kettle::coordinator::{Coordinator, CoordinatorConfig, Role};
//! use kettle::lock::MemoryLock;
//!
//! #[tokio::main]
//! async fn main() -> kettle::Result<()> {
//!     let coordinator = Coordinator::with_dependencies(
//!         CoordinatorConfig::default(),
//!         Arc::new(MemoryLock::new()),
//!         Arc::new(MemoryBus::new()),
//!     )?;
//!     coordinator.start();
//!
//!     let mut role = coordinator.subscribe_role();
//!     let _ = role.wait_for(|r| *r == Role::Master).await;
//!     let roster = coordinator.discover_workers(None).await?;
//!     println!("{} workers", roster.len());
//!
//!     coordinator.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bus;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod protocol;
pub mod utils;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{MemoryBus, MessageBus, RedisBus};
    pub use crate::config::Settings;
    pub use crate::coordinator::{
        Coordinator, CoordinatorConfig, CoordinatorOptions, NodeIdentity, Role, Roster,
        WorkerStatus,
    };
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::lock::{DistLock, LockHandle, MemoryLock, RedisLock};
    pub use crate::protocol::{Command, CommandKind, Response};
    pub use crate::worker::{WorkHandler, WorkerConfig, WorkerNode};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
