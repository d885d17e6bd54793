use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub kv_url: Option<String>,
    pub key_prefix: Option<String>,
    pub queue_name: Option<String>,
    pub metrics_port: Option<u16>,

    pub worker: Option<WorkerConfig>,
    pub counters: Option<CountersConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub default_timeout_secs: Option<u64>,
    pub keep_result_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub stuck_threshold_secs: Option<u64>,
    pub health_check_interval_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CountersConfig {
    pub retention_days: Option<u64>,
    pub flush_batch_size: Option<usize>,
    pub flush_cron: Option<String>,
    pub cleanup_cron: Option<String>,
    pub purge_cron: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
