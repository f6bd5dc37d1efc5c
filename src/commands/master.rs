use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::coordinator::{Coordinator, CoordinatorOptions, CoordinatorServer, Role};
use crate::error::Error;
use crate::metrics;

use super::shutdown_signal;

/// Parameters for the `master` command
#[derive(Debug, Clone, Default)]
pub struct MasterParams {
    pub settings: Settings,
    pub name: Option<String>,
    pub instance_id: Option<String>,
    pub redis_url: Option<String>,
    pub bind: Option<SocketAddr>,
    pub no_server: bool,
    pub discover_interval: Option<u64>,
    pub start_work: Option<String>,
}

/// Contend for leadership and, while master, discover and dispatch
pub async fn master(params: MasterParams) -> Result<()> {
    let mut settings = params.settings;

    if let Some(name) = params.name {
        settings.coordinator.name = name.clone();
        settings.worker.name = name;
    }
    if params.instance_id.is_some() {
        settings.coordinator.instance_id = params.instance_id;
    }
    if let Some(url) = params.redis_url {
        settings.coordinator.redis_url = url;
    }
    if let Some(bind) = params.bind {
        settings.server.bind_address = bind;
    }
    settings.validate()?;

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics unavailable");
    }

    let coordinator = Arc::new(
        Coordinator::new(CoordinatorOptions::new(settings.coordinator.clone()))
            .await
            .context("Failed to create coordinator")?,
    );
    let identity = coordinator.identity();

    println!("Starting kettle master");
    println!("======================");
    println!("  Group: {}", identity.name);
    println!("  Instance: {}", identity.instance_id);
    println!("  Lock: {}", settings.coordinator.lock_resource());
    println!("  Redis: {}", settings.coordinator.redis_url);
    if !params.no_server {
        println!("  Status API: http://{}", settings.server.bind_address);
    }
    println!();

    coordinator.start();

    let leader = tokio::spawn(lead(
        Arc::clone(&coordinator),
        params.discover_interval.map(Duration::from_secs),
        params.start_work.map(String::into_bytes),
    ));

    if params.no_server {
        shutdown_signal().await;
    } else {
        let server = CoordinatorServer::new(settings.server.clone(), Arc::clone(&coordinator));
        server
            .serve(shutdown_signal())
            .await
            .context("Status server failed")?;
    }

    coordinator.stop().await;
    leader.abort();

    println!("kettle master stopped.");
    Ok(())
}

/// Act on every promotion until the role channel closes
async fn lead(coordinator: Arc<Coordinator>, discover_every: Option<Duration>, payload: Option<Vec<u8>>) {
    let mut role = coordinator.subscribe_role();

    loop {
        if role.wait_for(|r| *r == Role::Master).await.is_err() {
            return;
        }
        println!("Became master (fencing token {:?})", coordinator.fencing_token());

        if let Err(e) = lead_term(&coordinator, discover_every, payload.as_deref()).await {
            match e {
                Error::NotMaster => println!("Leadership lost"),
                Error::Cancelled => return,
                other => tracing::warn!(error = %other, "Broadcast failed"),
            }
        }

        if role.wait_for(|r| *r != Role::Master).await.is_err() {
            return;
        }
    }
}

/// One term as master: discover, optionally dispatch, then keep discovering
async fn lead_term(
    coordinator: &Coordinator,
    discover_every: Option<Duration>,
    payload: Option<&[u8]>,
) -> crate::error::Result<()> {
    let roster = coordinator.discover_workers(None).await?;
    println!("Discovered {} worker(s): {:?}", roster.len(), roster.names());

    if let Some(payload) = payload {
        let acknowledged = coordinator.start_work(payload.to_vec(), None).await?;
        println!("Start work acknowledged by {} worker(s): {acknowledged:?}", acknowledged.len());
    }

    let Some(every) = discover_every else {
        return Ok(());
    };

    loop {
        tokio::time::sleep(every).await;
        let roster = coordinator.discover_workers(None).await?;
        tracing::info!(workers = roster.len(), "Periodic discovery");
    }
}
