//! In-process message bus
//!
//! Every channel is a `tokio::sync::broadcast` channel. Clones share the same
//! channels. With duplication enabled each publish is delivered twice, which
//! is how tests exercise at-least-once handling.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::{BusStream, MessageBus, PublishError};

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast-channel bus shared between clones
#[derive(Debug, Clone)]
pub struct MemoryBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
    capacity: usize,
    duplicate: bool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create a bus delivering each message once
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: DEFAULT_CAPACITY,
            duplicate: false,
        }
    }

    /// Create a bus delivering each message twice
    pub fn with_duplicates() -> Self {
        Self {
            duplicate: true,
            ..Self::new()
        }
    }

    fn sender(&self, channel: &str) -> Result<broadcast::Sender<Bytes>, PublishError> {
        let mut channels = self.channels.lock().map_err(|_| PublishError::Closed)?;
        Ok(channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone())
    }

    /// Number of live subscribers on `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|c| c.get(channel).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), PublishError> {
        let tx = self.sender(channel)?;
        let copies = if self.duplicate { 2 } else { 1 };

        // No subscribers is not an error: nobody is owed delivery
        for _ in 0..copies {
            let _ = tx.send(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusStream, PublishError> {
        let rx = self.sender(channel)?.subscribe();
        let channel = channel.to_string();

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %channel, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
