use cms_worker::admin::AdminService;
use cms_worker::config::{AppConfig, CliConfig, FileConfig, WorkerConfig};
use cms_worker::download_stats::SqliteDownloadStatsStore;
use cms_worker::kv::{KeyValueStore, MemoryKvStore};
use cms_worker::queue::Job;
use cms_worker::tasks::TaskRegistry;
use cms_worker::worker::{Worker, WorkerResources};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestStack {
    pub resources: Arc<WorkerResources>,
    pub admin: AdminService,
    _temp_dir: TempDir,
}

impl TestStack {
    pub fn new(registry: TaskRegistry) -> Self {
        Self::with_concurrency(registry, 4)
    }

    pub fn with_concurrency(registry: TaskRegistry, concurrency: usize) -> Self {
        Self::build(Arc::new(MemoryKvStore::new()), registry, concurrency)
    }

    pub fn with_kv(kv: Arc<dyn KeyValueStore>, registry: TaskRegistry) -> Self {
        Self::build(kv, registry, 4)
    }

    fn build(kv: Arc<dyn KeyValueStore>, registry: TaskRegistry, concurrency: usize) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            kv_url: Some("memory://".to_string()),
            key_prefix: Some("it".to_string()),
            ..Default::default()
        };
        let file = FileConfig {
            worker: Some(WorkerConfig {
                concurrency: Some(concurrency),
                poll_interval_ms: Some(20),
                heartbeat_interval_secs: Some(1),
                stuck_threshold_secs: Some(2),
                health_check_interval_secs: Some(1),
                shutdown_grace_secs: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, Some(file)).expect("Invalid test config");
        let store = SqliteDownloadStatsStore::new(config.download_stats_db_path())
            .expect("Failed to open download stats store");
        let resources = Arc::new(WorkerResources::from_parts(
            config,
            kv,
            Arc::new(store),
            Arc::new(registry),
        ));
        let admin = AdminService::new(&resources);
        Self {
            resources,
            admin,
            _temp_dir: temp_dir,
        }
    }

    pub fn spawn_worker(&self) -> RunningWorker {
        let token = CancellationToken::new();
        let worker = Worker::new(self.resources.clone(), token.clone());
        let worker_id = worker.worker_id().to_string();
        RunningWorker {
            worker_id,
            token,
            handle: tokio::spawn(worker.run()),
        }
    }

    /// Wait until the job reaches a final state.
    pub async fn wait_finished(&self, key: &str) -> Job {
        let queue = self.resources.queue.clone();
        let key_owned = key.to_string();
        wait_until(move || {
            queue
                .get_job(&key_owned)
                .ok()
                .flatten()
                .is_some_and(|job| job.status.is_finished())
        })
        .await;
        self.resources
            .queue
            .get_job(key)
            .unwrap()
            .expect("job disappeared")
    }

    pub async fn wait_active(&self, key: &str) {
        let queue = self.resources.queue.clone();
        let key = key.to_string();
        wait_until(move || {
            queue
                .get_job(&key)
                .ok()
                .flatten()
                .is_some_and(|job| job.status == cms_worker::queue::JobStatus::Active)
        })
        .await;
    }
}

pub struct RunningWorker {
    pub worker_id: String,
    pub token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningWorker {
    /// Signal shutdown and wait for the worker loop to drain.
    pub async fn stop(self) {
        self.token.cancel();
        tokio::time::timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("worker did not stop in time")
            .expect("worker task panicked");
    }
}

/// Poll `condition` every 10ms, panicking after the wait timeout.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {:?}", WAIT_TIMEOUT);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
