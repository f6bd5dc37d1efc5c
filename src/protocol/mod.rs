//! Command protocol between the master and its workers
//!
//! The master publishes a [`Command`] on the group's command channel and then
//! listens on the response channel for [`Response`]s that echo the command's
//! correlation id. Anything else seen on the response channel during the
//! collection window (late replies to an earlier broadcast, garbage) is
//! dropped here and never reaches the caller.
//!
//! # Wire format
//!
//! JSON with camelCase keys:
//!
//! ```text
//! Command  { kind, correlationId, issuerInstanceId, fencingToken, payload, issuedAt }
//! Response { correlationId, workerName, respondedAt }
//! ```
//!
//! `kind` is a closed set; a command with an unknown kind fails to decode.

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::bus::{MessageBus, PublishError};
use crate::error::{Error, Result};
use crate::metrics;
use crate::utils::now_millis;

// ============================================================================
// Channels
// ============================================================================

/// Channel names used by one coordination group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    /// Master -> workers
    pub commands: String,

    /// Workers -> master
    pub responses: String,
}

impl Channels {
    /// Channels for the group called `name`
    pub fn for_group(name: &str) -> Self {
        Self {
            commands: format!("{name}-commands"),
            responses: format!("{name}-responses"),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Instruction broadcast by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Every worker replies with its name
    ReportWorkerName,

    /// Every worker begins processing
    StartWork,
}

impl CommandKind {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::ReportWorkerName => "report_worker_name",
            Self::StartWork => "start_work",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A broadcast command; immutable once sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub kind: CommandKind,
    pub correlation_id: String,
    pub issuer_instance_id: String,
    /// Fencing token of the issuer's lock; 0 when the issuer sent none
    #[serde(default)]
    pub fencing_token: u64,
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Epoch milliseconds
    pub issued_at: i64,
}

impl Command {
    /// Create a command with a fresh correlation id
    pub fn new(
        kind: CommandKind,
        issuer_instance_id: impl Into<String>,
        fencing_token: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            issuer_instance_id: issuer_instance_id.into(),
            fencing_token,
            payload,
            issued_at: now_millis(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, MalformedMessage> {
        serde_json::from_slice(bytes).map_err(|e| MalformedMessage::Decode(e.to_string()))
    }
}

/// A worker's answer to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub correlation_id: String,
    pub worker_name: String,
    /// Epoch milliseconds
    pub responded_at: i64,
}

impl Response {
    /// Build the reply `worker_name` sends for `command`
    pub fn answering(command: &Command, worker_name: impl Into<String>) -> Self {
        Self {
            correlation_id: command.correlation_id.clone(),
            worker_name: worker_name.into(),
            responded_at: now_millis(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, MalformedMessage> {
        serde_json::from_slice(bytes).map_err(|e| MalformedMessage::Decode(e.to_string()))
    }
}

/// A message that was received but cannot be used
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    /// Payload is not a valid message
    #[error("undecodable message: {0}")]
    Decode(String),

    /// Response belongs to some other broadcast
    #[error("response for '{got}' does not match broadcast '{expected}'")]
    UnexpectedCorrelation { expected: String, got: String },
}

impl MalformedMessage {
    /// Label used in metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::UnexpectedCorrelation { .. } => "stale_correlation",
        }
    }
}

/// Decode a response and check it answers `expected`
pub fn accept_response(
    expected: &str,
    bytes: &[u8],
) -> std::result::Result<Response, MalformedMessage> {
    let response = Response::decode(bytes)?;
    if response.correlation_id != expected {
        return Err(MalformedMessage::UnexpectedCorrelation {
            expected: expected.to_string(),
            got: response.correlation_id,
        });
    }
    Ok(response)
}

// ============================================================================
// Broadcast / Collect
// ============================================================================

/// Result of one broadcast-then-collect exchange
#[derive(Debug, Clone)]
pub struct BroadcastOutcome {
    pub kind: CommandKind,
    pub correlation_id: String,

    /// One response per worker; the latest `responded_at` wins
    pub responses: Vec<Response>,

    /// Messages discarded during the window
    pub dropped: usize,
}

impl BroadcastOutcome {
    /// Names of the workers that answered
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.responses.iter().map(|r| r.worker_name.clone()).collect();
        names.sort();
        names
    }
}

/// Runs broadcasts for one coordinator
pub struct CommandProtocol {
    bus: Arc<dyn MessageBus>,
    channels: Channels,
    issuer: String,
}

impl CommandProtocol {
    pub fn new(bus: Arc<dyn MessageBus>, channels: Channels, issuer: impl Into<String>) -> Self {
        Self {
            bus,
            channels,
            issuer: issuer.into(),
        }
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Publish a command and gather correlated responses until `window` elapses
    ///
    /// The response channel is subscribed before the command goes out, so a
    /// fast worker cannot answer before anyone is listening. The exchange
    /// fails with [`Error::Cancelled`] as soon as `cancel` flips to `true` or
    /// its sender goes away. Nothing is retried.
    pub async fn broadcast(
        &self,
        kind: CommandKind,
        payload: Vec<u8>,
        fencing_token: u64,
        window: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<BroadcastOutcome> {
        if *cancel.borrow() {
            return Err(Error::Cancelled);
        }

        let mut replies = self.bus.subscribe(&self.channels.responses).await?;

        let command = Command::new(kind, self.issuer.clone(), fencing_token, payload);
        let correlation_id = command.correlation_id.clone();
        self.bus
            .publish(&self.channels.commands, command.encode()?)
            .await?;

        metrics::record_broadcast(kind.label());
        tracing::debug!(
            kind = %kind,
            correlation_id = %correlation_id,
            fencing_token,
            window_ms = window.as_millis() as u64,
            "Command broadcast, collecting responses"
        );

        let deadline = tokio::time::Instant::now() + window;
        let mut by_worker: HashMap<String, Response> = HashMap::new();
        let mut dropped = 0usize;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        tracing::debug!(correlation_id = %correlation_id, "Broadcast cancelled");
                        return Err(Error::Cancelled);
                    }
                }
                next = replies.next() => {
                    let Some(bytes) = next else {
                        return Err(PublishError::Closed.into());
                    };

                    match accept_response(&correlation_id, &bytes) {
                        Ok(response) => {
                            let newer = by_worker
                                .get(&response.worker_name)
                                .map_or(true, |seen| response.responded_at >= seen.responded_at);
                            if newer {
                                by_worker.insert(response.worker_name.clone(), response);
                            }
                        }
                        Err(e) => {
                            dropped += 1;
                            metrics::record_dropped(e.reason());
                            tracing::debug!(error = %e, "Dropped response");
                        }
                    }
                }
            }
        }

        let responses: Vec<Response> = by_worker.into_values().collect();
        metrics::record_responses(kind.label(), responses.len());
        tracing::debug!(
            kind = %kind,
            correlation_id = %correlation_id,
            responders = responses.len(),
            dropped,
            "Collection window closed"
        );

        Ok(BroadcastOutcome {
            kind,
            correlation_id,
            responses,
            dropped,
        })
    }
}
