use crate::config::AppConfig;
use crate::counters::CounterStore;
use crate::download_stats::{DownloadStatsStore, SqliteDownloadStatsStore};
use crate::kv::{open_store, KeyBuilder, KeyValueStore};
use crate::queue::JobQueue;
use crate::stats::StatsRecorder;
use crate::tasks::TaskRegistry;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared handles built once by [`WorkerResources::startup`] and passed to
/// every hook and task handler.
pub struct WorkerResources {
    pub config: AppConfig,
    pub kv: Arc<dyn KeyValueStore>,
    pub keys: KeyBuilder,
    pub queue: Arc<JobQueue>,
    pub counters: CounterStore,
    pub stats: StatsRecorder,
    pub download_stats: Arc<dyn DownloadStatsStore>,
}

/// Resources acquired so far. Released in reverse acquisition order.
#[derive(Default)]
struct Acquired {
    kv: Option<Arc<dyn KeyValueStore>>,
    download_stats: Option<Arc<dyn DownloadStatsStore>>,
}

impl Acquired {
    fn release(self) {
        match self.download_stats {
            Some(store) => {
                store.close();
                info!("Closed download stats store");
            }
            None => warn!("Download stats store was never opened, nothing to close"),
        }
        match self.kv {
            Some(kv) => {
                kv.close();
                info!("Closed key-value connection");
            }
            None => warn!("Key-value connection was never opened, nothing to close"),
        }
    }
}

impl WorkerResources {
    /// Acquire the key-value connection, then the durable store.
    ///
    /// On failure everything acquired so far is released before the error is
    /// returned.
    pub fn startup(config: &AppConfig, registry: Arc<TaskRegistry>) -> Result<Arc<Self>> {
        let mut acquired = Acquired::default();
        match Self::acquire(config, &mut acquired) {
            Ok(()) => {}
            Err(e) => {
                acquired.release();
                return Err(e);
            }
        }
        let (Some(kv), Some(download_stats)) = (acquired.kv, acquired.download_stats) else {
            anyhow::bail!("Worker resources incomplete after startup");
        };
        let resources = Self::from_parts(config.clone(), kv, download_stats, registry);
        info!(
            "Worker resources ready (kv: {}, prefix: {}, queue: {})",
            config.kv_url, config.key_prefix, config.queue_name
        );
        Ok(Arc::new(resources))
    }

    fn acquire(config: &AppConfig, acquired: &mut Acquired) -> Result<()> {
        let kv = open_store(&config.kv_url)
            .with_context(|| format!("Failed to open key-value store {}", config.kv_url))?;
        acquired.kv = Some(kv.clone());
        kv.ping()
            .with_context(|| format!("Key-value store {} is unreachable", config.kv_url))?;

        let db_path = config.download_stats_db_path();
        let store = SqliteDownloadStatsStore::new(&db_path)
            .with_context(|| format!("Failed to open download stats database {:?}", db_path))?;
        acquired.download_stats = Some(Arc::new(store));
        Ok(())
    }

    /// Assemble resources around already opened stores.
    pub fn from_parts(
        config: AppConfig,
        kv: Arc<dyn KeyValueStore>,
        download_stats: Arc<dyn DownloadStatsStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        let keys = KeyBuilder::new(config.key_prefix.clone());
        let queue = Arc::new(JobQueue::new(
            kv.clone(),
            keys.clone(),
            config.queue_settings(),
            registry,
        ));
        let counters = CounterStore::new(kv.clone(), keys.clone());
        let stats = StatsRecorder::new(kv.clone(), keys.clone());
        Self {
            config,
            kv,
            keys,
            queue,
            counters,
            stats,
            download_stats,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        self.queue.registry()
    }

    /// Release the durable store, then the key-value connection.
    pub fn shutdown(&self) {
        info!("Releasing worker resources");
        Acquired {
            kv: Some(self.kv.clone()),
            download_stats: Some(self.download_stats.clone()),
        }
        .release();
    }
}


#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::CliConfig;
    use crate::kv::MemoryKvStore;
    use tempfile::TempDir;

    /// In-memory key-value store plus a SQLite store in a temp dir.
    pub fn test_resources(registry: TaskRegistry) -> (Arc<WorkerResources>, TempDir) {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            kv_url: Some("memory://".to_string()),
            key_prefix: Some("test".to_string()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, None).unwrap();
        let store = SqliteDownloadStatsStore::new(config.download_stats_db_path()).unwrap();
        let resources = WorkerResources::from_parts(
            config,
            Arc::new(MemoryKvStore::new()),
            Arc::new(store),
            Arc::new(registry),
        );
        (Arc::new(resources), dir)
    }
}
