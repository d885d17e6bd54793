use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cms_worker::admin::{AdminService, JobListQuery, SortKey, SortOrder};
use cms_worker::config::{AppConfig, CliConfig, FileConfig};
use cms_worker::jobs::{default_cron_definitions, default_registry};
use cms_worker::queue::JobStatus;
use cms_worker::worker::WorkerResources;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(name = "cms-admin", about = "Inspect and control the CMS job queue")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the download stats database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Key-value service URL shared with the workers: redis://host:port/db.
    #[clap(long)]
    pub kv_url: Option<String>,

    #[clap(long)]
    pub key_prefix: Option<String>,

    #[clap(long)]
    pub queue: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Shows queue sizes, latency and the number of live workers.
    QueueInfo,

    /// Lists jobs, in enqueue order unless --sort-by is given.
    List {
        /// queued, scheduled, active, complete, failed or aborted.
        #[clap(long)]
        status: Option<String>,

        #[clap(long, default_value_t = 100)]
        limit: usize,

        /// function, status, started or attempts.
        #[clap(long)]
        sort_by: Option<String>,

        /// asc or desc.
        #[clap(long, default_value = "asc")]
        order: String,
    },

    /// Shows a single job, with its error split from the trace.
    Show { job_key: String },

    /// Moves a failed or aborted job back to the queue.
    Retry { job_key: String },

    /// Asks the worker running a job to stop it.
    Abort { job_key: String },

    /// Enqueues a registered task.
    Enqueue {
        function: String,

        /// Keyword arguments as a JSON object.
        #[clap(long, default_value = "{}")]
        kwargs: String,
    },

    /// Lists registered tasks.
    Tasks,

    /// Shows queue counts with per-function execution totals.
    Stats,

    /// Shows recurring job schedules with their next and previous runs.
    Cron,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            db_dir: args.db_dir.clone(),
            kv_url: args.kv_url.clone(),
            key_prefix: args.key_prefix.clone(),
            queue_name: args.queue.clone(),
            metrics_port: 0,
            concurrency: None,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_query(
    status: Option<String>,
    limit: usize,
    sort_by: Option<String>,
    order: &str,
) -> Result<JobListQuery> {
    let status = match status {
        Some(s) => match JobStatus::parse(&s) {
            Some(status) => Some(status),
            None => bail!("Unknown status: {}", s),
        },
        None => None,
    };
    let sort_by = match sort_by {
        Some(s) => match SortKey::parse(&s) {
            Some(key) => Some(key),
            None => bail!("Unknown sort key: {}", s),
        },
        None => None,
    };
    let Some(sort_order) = SortOrder::parse(order) else {
        bail!("Unknown sort order: {}", order);
    };
    Ok(JobListQuery {
        status,
        limit,
        sort_by,
        sort_order,
    })
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let app_config = AppConfig::resolve(&CliConfig::from(&cli_args), file_config)?;
    app_config.ensure_shared_kv()?;
    let resources = WorkerResources::startup(&app_config, Arc::new(default_registry()))?;
    let admin = AdminService::new(&resources);

    let result = match cli_args.command {
        Command::QueueInfo => print_json(&admin.queue_info()),
        Command::List {
            status,
            limit,
            sort_by,
            order,
        } => list_query(status, limit, sort_by, &order)
            .and_then(|query| print_json(&admin.list_jobs(&query))),
        Command::Show { job_key } => match admin.job_detail(&job_key) {
            Some(detail) => print_json(&detail),
            None => Err(anyhow::anyhow!("Job not found: {}", job_key)),
        },
        Command::Retry { job_key } => print_json(&admin.retry_job(&job_key)),
        Command::Abort { job_key } => print_json(&admin.abort_job(&job_key)),
        Command::Enqueue { function, kwargs } => serde_json::from_str::<serde_json::Value>(&kwargs)
            .context("--kwargs must be a JSON object")
            .and_then(|kwargs| print_json(&admin.enqueue_task(&function, kwargs))),
        Command::Tasks => print_json(&admin.available_tasks()),
        Command::Stats => print_json(&admin.summary_stats()),
        Command::Cron => default_cron_definitions(&app_config.counters)
            .map_err(anyhow::Error::from)
            .and_then(|defs| print_json(&admin.cron_overview(&defs))),
    };

    resources.shutdown();
    result
}
