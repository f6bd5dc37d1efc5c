use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kettle::commands::{load_settings, master, worker, MasterParams, WorkerParams};

#[derive(Parser)]
#[command(
    name = "kettle",
    version,
    about = "Master election and worker coordination over Redis",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the settings
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// TOML settings file (defaults to KETTLE_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Contend for leadership and coordinate workers while master
    Master {
        /// Group name
        #[arg(short, long)]
        name: Option<String>,

        /// Instance id (generated when omitted)
        #[arg(long)]
        instance_id: Option<String>,

        /// Redis URL
        #[arg(long)]
        redis_url: Option<String>,

        /// Status API bind address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Do not start the status API
        #[arg(long, default_value = "false")]
        no_server: bool,

        /// Re-discover workers every N seconds while master
        #[arg(long)]
        discover_interval: Option<u64>,

        /// Broadcast start-work with this payload on each promotion
        #[arg(long)]
        start_work: Option<String>,
    },

    /// Answer the master's commands
    Worker {
        /// Group name
        #[arg(short, long)]
        name: Option<String>,

        /// Name reported to the master (generated when omitted)
        #[arg(short, long)]
        worker_name: Option<String>,

        /// Redis URL
        #[arg(long)]
        redis_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref())?;
    if cli.verbose {
        settings.coordinator.verbose = true;
    }
    if let Some(format) = cli.log_format {
        settings.logging.format = format;
    }

    // Initialize tracing/logging
    setup_tracing(&settings.logging.format, &settings.log_directives(cli.verbose))?;

    match cli.command {
        Commands::Master {
            name,
            instance_id,
            redis_url,
            bind,
            no_server,
            discover_interval,
            start_work,
        } => {
            tracing::info!(
                name = ?name,
                instance_id = ?instance_id,
                discover_interval = ?discover_interval,
                "Starting master command"
            );
            master(MasterParams {
                settings,
                name,
                instance_id,
                redis_url,
                bind,
                no_server,
                discover_interval,
                start_work,
            })
            .await?;
        }

        Commands::Worker {
            name,
            worker_name,
            redis_url,
        } => {
            tracing::info!(name = ?name, worker_name = ?worker_name, "Starting worker command");
            worker(WorkerParams {
                settings,
                name,
                worker_name,
                redis_url,
            })
            .await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, directives: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
