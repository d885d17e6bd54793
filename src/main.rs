use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cms_worker::config::{AppConfig, CliConfig, FileConfig};
use cms_worker::cron::CronScheduler;
use cms_worker::jobs::{default_cron_definitions, default_registry};
use cms_worker::metrics;
use cms_worker::worker::{Worker, WorkerResources};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the download stats database.
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Key-value service URL: memory:// or redis://host:port/db.
    #[clap(long)]
    pub kv_url: Option<String>,

    /// Prefix of every key written to the key-value service.
    #[clap(long)]
    pub key_prefix: Option<String>,

    /// Name of the queue to consume.
    #[clap(long)]
    pub queue: Option<String>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Maximum number of jobs executed at once by this process.
    #[clap(short, long)]
    pub concurrency: Option<usize>,

    /// Only consume jobs; recurring jobs are enqueued by other processes.
    #[clap(long)]
    pub no_cron: bool,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            db_dir: args.db_dir.clone(),
            kv_url: args.kv_url.clone(),
            key_prefix: args.key_prefix.clone(),
            queue_name: args.queue.clone(),
            metrics_port: args.metrics_port,
            concurrency: args.concurrency,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&CliConfig::from(&cli_args), file_config)?;
    if app_config.uses_process_local_kv() {
        warn!(
            "kv_url {} keeps jobs and stats inside this process; other workers and cms-admin will not see them",
            app_config.kv_url
        );
    }

    info!("Initializing metrics...");
    metrics::init_metrics();

    let registry = Arc::new(default_registry());
    info!("Registered {} task handlers", registry.len());
    for handler in registry.iter() {
        info!("  {}", handler.name());
    }
    let definitions = default_cron_definitions(&app_config.counters)?;

    let resources = WorkerResources::startup(&app_config, registry)?;
    let shutdown_token = CancellationToken::new();

    if app_config.metrics_port > 0 {
        let port = app_config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(port).await {
                error!("Metrics server stopped: {}", e);
            }
        });
        info!("Metrics available at port {}!", port);
    }

    let scheduler_handle = if cli_args.no_cron {
        info!("Cron scheduler disabled");
        None
    } else {
        let scheduler = CronScheduler::new(
            resources.queue.clone(),
            definitions,
            shutdown_token.clone(),
        );
        Some(tokio::spawn(scheduler.run()))
    };

    let worker = Worker::new(resources.clone(), shutdown_token.clone());
    info!("Worker {} ready", worker.worker_id());
    let mut worker_handle = tokio::spawn(worker.run());

    tokio::select! {
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
            shutdown_token.cancel();
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
            if let Err(e) = worker_handle.await {
                error!("Worker task failed: {}", e);
            }
        }
    }

    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    resources.shutdown();
    info!("Shutdown complete");
    Ok(())
}
