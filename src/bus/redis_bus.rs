//! Redis pub/sub transport

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::Pool;
use futures::StreamExt;

use super::{BusStream, MessageBus, PublishError};

/// Message bus over Redis `PUBLISH` / `SUBSCRIBE`
///
/// Publishing goes through the shared connection pool. Each subscription
/// opens its own dedicated pub/sub connection, which is closed when the
/// returned stream is dropped.
pub struct RedisBus {
    client: redis::Client,
    pool: Pool,
}

impl RedisBus {
    /// Create a bus from a client (for subscriptions) and a pool (for publishing)
    pub fn new(client: redis::Client, pool: Pool) -> Self {
        Self { client, pool }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), PublishError> {
        let transport = |reason: String| PublishError::Transport {
            channel: channel.to_string(),
            reason,
        };

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| transport(format!("pool: {e}")))?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_ref())
            .query_async(&mut *conn)
            .await
            .map_err(|e| transport(e.to_string()))?;

        tracing::trace!(channel = %channel, receivers, "Published to Redis channel");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusStream, PublishError> {
        let subscribe_err = |reason: String| PublishError::Subscribe {
            channel: channel.to_string(),
            reason,
        };

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));

        Ok(stream.boxed())
    }
}
