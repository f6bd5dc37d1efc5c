pub mod master;
pub mod worker;

// Re-export command functions for convenience
pub use master::{master, MasterParams};
pub use worker::{worker, WorkerParams};

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Settings;

/// Load settings from `path` when given, otherwise from the environment
///
/// Called once by the binary, before logging is set up, so the logging
/// settings apply from the first line.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::from_env().context("Failed to read settings from environment"),
    }
}

/// Resolve once Ctrl+C is received
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to wait for Ctrl+C"),
    }
}
