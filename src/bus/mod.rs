//! Publish/subscribe message transport
//!
//! The [`MessageBus`] capability delivers opaque byte payloads to every
//! subscriber of a named channel. Delivery is at-least-once and unordered
//! across subscribers; there is no guarantee about how many subscribers
//! receive a message. A subscription is an infinite stream that starts at the
//! moment of subscribing and cannot be replayed from an earlier offset.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod memory;
pub mod redis_bus;

pub use memory::MemoryBus;
pub use redis_bus::RedisBus;

/// Stream of payloads received on one channel
pub type BusStream = BoxStream<'static, Bytes>;

/// Failures sending a broadcast or opening the channel its replies arrive on
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The transport rejected or lost the publish
    #[error("failed to publish to '{channel}': {reason}")]
    Transport { channel: String, reason: String },

    /// The reply channel could not be subscribed
    #[error("failed to subscribe to '{channel}': {reason}")]
    Subscribe { channel: String, reason: String },

    /// The bus has been shut down
    #[error("message bus is closed")]
    Closed,
}

impl PublishError {
    /// Transport hiccups are worth another broadcast, a closed bus is not
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Publish/subscribe transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send `payload` to every current subscriber of `channel`
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), PublishError>;

    /// Receive every payload published to `channel` from now on
    async fn subscribe(&self, channel: &str) -> Result<BusStream, PublishError>;
}
