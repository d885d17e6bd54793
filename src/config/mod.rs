mod file_config;

pub use file_config::{CountersConfig, FileConfig, WorkerConfig};

use crate::cron::CronExpression;
use crate::queue::QueueSettings;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Workers and the admin tool must reach the same service, so the default is
/// a local Redis when that backend is compiled in.
#[cfg(feature = "redis")]
pub const DEFAULT_KV_URL: &str = "redis://127.0.0.1/";
#[cfg(not(feature = "redis"))]
pub const DEFAULT_KV_URL: &str = "memory://";
pub const MEMORY_KV_URL: &str = "memory://";
/// Upper bound on counter retention, one century.
pub const MAX_RETENTION_DAYS: u64 = 36_500;
pub const DEFAULT_KEY_PREFIX: &str = "cms";
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub kv_url: Option<String>,
    pub key_prefix: Option<String>,
    pub queue_name: Option<String>,
    pub metrics_port: u16,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub kv_url: String,
    pub key_prefix: String,
    pub queue_name: String,
    /// 0 disables the metrics endpoint.
    pub metrics_port: u16,

    pub worker: WorkerSettings,
    pub counters: CounterSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let kv_url = file
            .kv_url
            .or_else(|| cli.kv_url.clone())
            .unwrap_or_else(|| DEFAULT_KV_URL.to_string());
        validate_kv_url(&kv_url)?;

        let key_prefix = file
            .key_prefix
            .or_else(|| cli.key_prefix.clone())
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        if key_prefix.is_empty() || key_prefix.contains(char::is_whitespace) {
            bail!("key_prefix must be a non-empty word, got {:?}", key_prefix);
        }

        let queue_name = file
            .queue_name
            .or_else(|| cli.queue_name.clone())
            .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let worker_file = file.worker.unwrap_or_default();
        let defaults = WorkerSettings::default();
        let worker = WorkerSettings {
            concurrency: worker_file
                .concurrency
                .or(cli.concurrency)
                .unwrap_or(defaults.concurrency),
            poll_interval_ms: worker_file
                .poll_interval_ms
                .unwrap_or(defaults.poll_interval_ms),
            default_timeout_secs: worker_file
                .default_timeout_secs
                .unwrap_or(defaults.default_timeout_secs),
            keep_result_secs: worker_file
                .keep_result_secs
                .unwrap_or(defaults.keep_result_secs),
            heartbeat_interval_secs: worker_file
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            stuck_threshold_secs: worker_file
                .stuck_threshold_secs
                .unwrap_or(defaults.stuck_threshold_secs),
            health_check_interval_secs: worker_file
                .health_check_interval_secs
                .unwrap_or(defaults.health_check_interval_secs),
            shutdown_grace_secs: worker_file
                .shutdown_grace_secs
                .unwrap_or(defaults.shutdown_grace_secs),
        };
        worker.validate()?;

        let counters_file = file.counters.unwrap_or_default();
        let defaults = CounterSettings::default();
        let counters = CounterSettings {
            retention_days: counters_file
                .retention_days
                .unwrap_or(defaults.retention_days),
            flush_batch_size: counters_file
                .flush_batch_size
                .unwrap_or(defaults.flush_batch_size),
            flush_cron: counters_file.flush_cron.unwrap_or(defaults.flush_cron),
            cleanup_cron: counters_file.cleanup_cron.unwrap_or(defaults.cleanup_cron),
            purge_cron: counters_file.purge_cron.unwrap_or(defaults.purge_cron),
        };
        counters.validate()?;

        Ok(Self {
            db_dir,
            kv_url,
            key_prefix,
            queue_name,
            metrics_port,
            worker,
            counters,
        })
    }

    /// Whether the key-value backend lives only inside this process.
    pub fn uses_process_local_kv(&self) -> bool {
        self.kv_url.starts_with(MEMORY_KV_URL)
    }

    /// Fails for a process-local backend: a separate process can never see
    /// the jobs or stats of a worker through it.
    pub fn ensure_shared_kv(&self) -> Result<()> {
        if self.uses_process_local_kv() {
            bail!(
                "kv_url {} is private to this process; point --kv-url at the service the workers use",
                self.kv_url
            );
        }
        Ok(())
    }

    pub fn download_stats_db_path(&self) -> PathBuf {
        self.db_dir.join("download_stats.db")
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            name: self.queue_name.clone(),
            default_timeout: Duration::from_secs(self.worker.default_timeout_secs),
            keep_result: Duration::from_secs(self.worker.keep_result_secs),
            lock_ttl: self.worker.lock_ttl(),
        }
    }
}

fn validate_kv_url(url: &str) -> Result<()> {
    if url.starts_with(MEMORY_KV_URL) {
        return Ok(());
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        if cfg!(feature = "redis") {
            return Ok(());
        }
        bail!("kv_url {} needs the redis feature", url);
    }
    bail!("Unsupported kv_url scheme: {}", url);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub default_timeout_secs: u64,
    pub keep_result_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub stuck_threshold_secs: u64,
    pub health_check_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval_ms: 500,
            default_timeout_secs: 300,
            keep_result_secs: 86400,
            heartbeat_interval_secs: 10,
            stuck_threshold_secs: 120,
            health_check_interval_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl WorkerSettings {
    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("worker.concurrency must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("worker.poll_interval_ms must be at least 1");
        }
        if self.default_timeout_secs == 0 {
            bail!("worker.default_timeout_secs must be at least 1");
        }
        if self.heartbeat_interval_secs == 0 || self.health_check_interval_secs == 0 {
            bail!("worker heartbeat and health check intervals must be at least 1 second");
        }
        if self.stuck_threshold_secs <= self.heartbeat_interval_secs {
            bail!(
                "worker.stuck_threshold_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.stuck_threshold_secs,
                self.heartbeat_interval_secs
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    /// Claim locks survive two missed heartbeats.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.saturating_mul(3))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSettings {
    pub retention_days: u64,
    pub flush_batch_size: usize,
    pub flush_cron: String,
    pub cleanup_cron: String,
    pub purge_cron: String,
}

impl Default for CounterSettings {
    fn default() -> Self {
        Self {
            retention_days: 7,
            flush_batch_size: 500,
            flush_cron: "*/10 * * * *".to_string(),
            cleanup_cron: "30 3 * * *".to_string(),
            purge_cron: "15 * * * *".to_string(),
        }
    }
}

impl CounterSettings {
    fn validate(&self) -> Result<()> {
        if self.flush_batch_size == 0 {
            bail!("counters.flush_batch_size must be at least 1");
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            bail!(
                "counters.retention_days must be at most {}, got {}",
                MAX_RETENTION_DAYS,
                self.retention_days
            );
        }
        for (name, expression) in [
            ("flush_cron", &self.flush_cron),
            ("cleanup_cron", &self.cleanup_cron),
            ("purge_cron", &self.purge_cron),
        ] {
            CronExpression::parse(expression)
                .with_context(|| format!("Invalid counters.{}: {:?}", name, expression))?;
        }
        Ok(())
    }

    /// Expiry set on daily counter keys: one day past the retention window.
    pub fn daily_key_ttl(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_add(1).saturating_mul(86400))
    }
}
