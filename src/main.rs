use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use access_sync::api::{self, ApiState};
use access_sync::config::{parse_duration, ScheduleConfig, SyncSettings};
use access_sync::scheduler::{MetricsRegistry, Scheduler};
use access_sync::shutdown::install_shutdown_handler;
use access_sync::sync::{self, Clients, MemoryBackend, JOB_NAMES};

#[derive(Parser, Debug)]
#[command(name = "access-sync")]
#[command(version)]
#[command(about = "Periodically reconciles identity, access and cost-attribution state")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler and the HTTP trigger surface
    Serve(ServeArgs),

    /// Print the schedule every job resolves to from the environment
    Jobs {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// How often the scheduler checks for due jobs (e.g. "1m", "30s")
    #[arg(long, default_value = "1m")]
    tick_interval: String,

    /// JSON document with the state of the in-memory backend
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct JobScheduleOutput {
    name: String,
    enabled: bool,
    interval_secs: u64,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let tick_every = parse_duration(&args.tick_interval)?;
    if tick_every.is_zero() {
        return Err("--tick-interval must be greater than zero".into());
    }
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let settings = Arc::new(SyncSettings::from_env()?);

    let backend = match &args.state_file {
        Some(path) => MemoryBackend::load(path).await?,
        None => {
            tracing::warn!("No --state-file given, starting with an empty in-memory backend");
            MemoryBackend::default()
        }
    };
    let clients = Clients::memory(Arc::new(backend));

    let shutdown = install_shutdown_handler();
    let metrics = Arc::new(MetricsRegistry::default());
    let mut scheduler = Scheduler::new(shutdown.clone(), metrics.clone());
    sync::register_all(&mut scheduler, &clients, settings, |key| std::env::var(key).ok())?;
    let scheduler = Arc::new(scheduler);

    let api_state = ApiState {
        scheduler: scheduler.clone(),
        metrics,
        shutdown: shutdown.clone(),
    };
    let api_handle = tokio::spawn(api::run_api(listen_addr, api_state));

    tracing::info!(
        jobs = ?scheduler.job_names(),
        tick_secs = tick_every.as_secs(),
        "Scheduler started"
    );
    scheduler.run(tick_every).await;

    scheduler.shutdown().await;
    match tokio::time::timeout(Duration::from_secs(5), api_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server failed"),
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task panicked"),
        Err(_) => tracing::warn!("HTTP server did not stop in time"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn handle_jobs(output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let mut jobs = Vec::with_capacity(JOB_NAMES.len());
    for name in JOB_NAMES {
        let config = ScheduleConfig::from_env(name)?;
        jobs.push(JobScheduleOutput {
            name: name.to_string(),
            enabled: config.enabled,
            interval_secs: config.interval.as_secs(),
        });
    }

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            println!("{:<22} {:<8} INTERVAL", "JOB", "ENABLED");
            println!("{}", "-".repeat(42));
            for job in &jobs {
                println!(
                    "{:<22} {:<8} {}s",
                    job.name, job.enabled, job.interval_secs
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await,
        Commands::Jobs { output } => handle_jobs(output),
    }
}
