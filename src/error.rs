//! Unified error handling for the kettle crate
//!
//! Each component owns a narrow error type ([`LockError`], [`PublishError`],
//! [`MalformedMessage`], [`ConfigError`]). The [`Error`] enum wraps them for
//! the operations a caller of the [`Coordinator`](crate::coordinator::Coordinator)
//! can observe.
//!
//! # Propagation
//!
//! - Lock failures never escape the election loop; they only change the role.
//! - Malformed or stale messages are dropped inside the protocol layer.
//! - `NotMaster`, `Publish`, `Cancelled` and `Config` reach the caller.
//!
//! ```rust,ignore
//! use kettle::error::{Error, ErrorCategory};
//!
//! match coordinator.discover_workers(None).await {
//!     Err(Error::NotMaster) => tracing::debug!("not leading, skipping discovery"),
//!     Err(e) if e.is_recoverable() => tracing::warn!(error = %e, "discovery failed, will retry"),
//!     Err(e) => return Err(e),
//!     Ok(roster) => println!("{} workers", roster.len()),
//! }
//! ```

use thiserror::Error;

pub use crate::bus::PublishError;
pub use crate::coordinator::config::ConfigError;
pub use crate::lock::LockError;
pub use crate::protocol::MalformedMessage;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Distributed lock acquire/renew/release failures
    Lock,
    /// Message bus publish/subscribe failures
    Transport,
    /// Undecodable or uncorrelated messages
    Protocol,
    /// Operation needs leadership this process does not hold
    Leadership,
    /// Operation interrupted by shutdown
    Cancelled,
    /// Configuration and dependency construction errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Leadership => "leadership",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the kettle crate
#[derive(Error, Debug)]
pub enum Error {
    /// Distributed lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Broadcast could not be sent or its replies could not be received
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Message could not be decoded or did not match the active broadcast
    #[error("Malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    /// Operation requires the master role
    #[error("Operation requires the master role")]
    NotMaster,

    /// Operation interrupted because the coordinator is stopping
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// Configuration or dependency construction errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Check if this error is recoverable (the operation can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Lock(_) => true,
            Self::Publish(e) => e.is_recoverable(),
            Self::Malformed(_) => true,
            // Leadership may be regained on a later election cycle
            Self::NotMaster => true,
            Self::Cancelled => false,
            Self::Config(_) => false,
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Lock(_) => ErrorCategory::Lock,
            Self::Publish(_) => ErrorCategory::Transport,
            Self::Malformed(_) | Self::Json(_) => ErrorCategory::Protocol,
            Self::NotMaster => ErrorCategory::Leadership,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(ConfigError::Invalid(msg.into()))
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
