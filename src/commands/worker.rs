use anyhow::{Context, Result};
use std::sync::Arc;

use crate::backend::RedisBackend;
use crate::config::Settings;
use crate::utils::retry::RetryConfig;
use crate::worker::{LoggingHandler, WorkerNode};

use super::shutdown_signal;

/// Parameters for the `worker` command
#[derive(Debug, Clone, Default)]
pub struct WorkerParams {
    pub settings: Settings,
    pub name: Option<String>,
    pub worker_name: Option<String>,
    pub redis_url: Option<String>,
}

/// Answer the master's commands until Ctrl+C
pub async fn worker(params: WorkerParams) -> Result<()> {
    let mut settings = params.settings;

    if let Some(name) = params.name {
        settings.coordinator.name = name.clone();
        settings.worker.name = name;
    }
    if params.worker_name.is_some() {
        settings.worker.worker_name = params.worker_name;
    }
    if let Some(url) = params.redis_url {
        settings.coordinator.redis_url = url;
    }
    settings.validate()?;

    let backend = RedisBackend::connect(&settings.coordinator.redis_url, &RetryConfig::default())
        .await
        .context("Failed to connect to Redis")?;

    let node = WorkerNode::new(settings.worker.clone(), backend.bus(), Arc::new(LoggingHandler))
        .context("Failed to create worker")?;

    println!("Starting kettle worker");
    println!("======================");
    println!("  Group: {}", settings.worker.name);
    println!("  Worker: {}", node.worker_name());
    println!("  Redis: {}", settings.coordinator.redis_url);
    println!("Press Ctrl+C to stop.\n");

    let handle = node.spawn().await.context("Failed to subscribe to commands")?;
    shutdown_signal().await;

    let stats = handle.stop().await.context("Worker failed")?;
    println!(
        "kettle worker stopped: {} command(s), {} response(s), {} start(s), {} failed",
        stats.commands_received, stats.responses_sent, stats.work_started, stats.failed
    );
    Ok(())
}
