use super::hooks::{after_process, before_process};
use super::resources::WorkerResources;
use crate::metrics;
use crate::queue::{Job, JobQueue, QueueError};
use crate::tasks::{TaskContext, TaskError};
use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Domain of the per-worker health records.
pub const WORKERS_DOMAIN: &str = "workers";

/// Snapshot each worker publishes under `{prefix}:workers:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub queue: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub active_jobs: usize,
    pub concurrency_limit: usize,
    pub jobs_complete: u64,
    pub jobs_failed: u64,
    pub jobs_recovered: u64,
}

#[derive(Default)]
struct WorkerCounters {
    complete: AtomicU64,
    failed: AtomicU64,
    recovered: AtomicU64,
}

/// How a single execution ended.
enum Outcome {
    Returned(Result<JsonValue, TaskError>),
    Panicked(String),
    TimedOut,
}

/// Long-lived dequeue/execute loop.
///
/// At most `concurrency` jobs run at once in this process. Other processes
/// may consume the same queue; the queue's claim locks keep them apart.
pub struct Worker {
    worker_id: String,
    resources: Arc<WorkerResources>,
    semaphore: Arc<Semaphore>,
    shutdown_token: CancellationToken,
    counters: Arc<WorkerCounters>,
}

impl Worker {
    pub fn new(resources: Arc<WorkerResources>, shutdown_token: CancellationToken) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let worker_id = format!("{}_{}_{}", host, std::process::id(), &suffix[..6]);
        let concurrency = resources.config.worker.concurrency;
        Self {
            worker_id,
            resources,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            shutdown_token,
            counters: Arc::new(WorkerCounters::default()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn running_jobs(&self) -> usize {
        self.resources
            .config
            .worker
            .concurrency
            .saturating_sub(self.semaphore.available_permits())
    }

    fn jittered_poll_delay(&self) -> Duration {
        let base = self.resources.config.worker.poll_interval().as_secs_f64();
        let delay = rand::rng().random_range(base * 0.5..=base * 1.5);
        Duration::from_secs_f64(delay.max(0.001))
    }

    /// Run until the shutdown token fires, then wait for running jobs up to
    /// the configured grace period.
    pub async fn run(self) {
        let worker = Arc::new(self);
        info!(
            "Worker {} started on queue {} with concurrency {}",
            worker.worker_id,
            worker.resources.queue.name(),
            worker.resources.config.worker.concurrency
        );

        worker
            .blocking(|w| {
                w.recover_lost_jobs();
                w.write_health();
            })
            .await;

        let health_handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.health_loop().await })
        };

        let mut running: Vec<JoinHandle<()>> = Vec::new();
        loop {
            running.retain(|handle| !handle.is_finished());

            let permit = tokio::select! {
                permit = worker.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Worker semaphore closed: {}", e);
                        break;
                    }
                },
                _ = worker.shutdown_token.cancelled() => break,
            };

            let dequeued = worker
                .blocking(|w| w.resources.queue.dequeue(&w.worker_id))
                .await;
            match dequeued {
                Some(Ok(Some(job))) => {
                    let worker = worker.clone();
                    running.push(tokio::spawn(async move {
                        let _permit = permit;
                        worker.process(job).await;
                    }));
                    continue;
                }
                Some(Ok(None)) | None => drop(permit),
                Some(Err(e)) => {
                    drop(permit);
                    error!("Worker {} failed to dequeue: {}", worker.worker_id, e);
                }
            }

            let delay = worker.jittered_poll_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = worker.shutdown_token.cancelled() => break,
            }
        }

        worker.drain(running).await;
        let _ = health_handle.await;
        worker.blocking(|w| w.clear_health()).await;
        info!("Worker {} stopped", worker.worker_id);
    }

    /// Run a synchronous key-value round trip on the blocking pool, keeping
    /// the async threads free for timers and other jobs.
    async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Option<T>
    where
        F: FnOnce(&Worker) -> T + Send + 'static,
        T: Send + 'static,
    {
        let worker = self.clone();
        match tokio::task::spawn_blocking(move || f(&worker)).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Key-value call on blocking pool failed: {}", e);
                None
            }
        }
    }

    async fn drain(&self, running: Vec<JoinHandle<()>>) {
        let running: Vec<_> = running.into_iter().filter(|h| !h.is_finished()).collect();
        if running.is_empty() {
            return;
        }
        let grace = self.resources.config.worker.shutdown_grace();
        info!(
            "Waiting up to {:?} for {} running jobs to finish",
            grace,
            running.len()
        );
        if tokio::time::timeout(grace, join_all(running)).await.is_err() {
            warn!(
                "Shutdown grace period elapsed with jobs still running; their locks will expire"
            );
        }
    }

    /// Execute one claimed job. Returns only once the handler thread has
    /// exited, so the caller's permit covers the whole execution.
    async fn process(self: &Arc<Self>, job: Job) {
        before_process(&job);
        metrics::set_running_jobs(self.running_jobs());
        let started = Instant::now();

        let Some(handler) = self.resources.registry().get(&job.function) else {
            error!("No handler registered for {} (job {})", job.function, job.key);
            let message = format!("Unknown function: {}", job.function);
            self.settle(job, "failed", started, move |q, key| q.mark_failed(key, &message))
                .await;
            return;
        };

        let token = CancellationToken::new();
        let ctx = TaskContext::new(
            job.key.clone(),
            job.function.clone(),
            job.attempts,
            token.clone(),
            self.resources.clone(),
        );
        let kwargs = job.kwargs.clone();
        let mut handle = tokio::task::spawn_blocking(move || handler.execute(&ctx, &kwargs));

        let settings = &self.resources.config.worker;
        let deadline = tokio::time::sleep(job.timeout());
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(settings.poll_interval());
        ticker.tick().await;
        let mut last_heartbeat = Instant::now();
        let mut abort_requested = false;

        let outcome = loop {
            tokio::select! {
                result = &mut handle => {
                    break match result {
                        Ok(returned) => Outcome::Returned(returned),
                        Err(e) => Outcome::Panicked(e.to_string()),
                    };
                }
                _ = &mut deadline => {
                    token.cancel();
                    break Outcome::TimedOut;
                }
                _ = ticker.tick() => {
                    if last_heartbeat.elapsed() >= settings.heartbeat_interval() {
                        let key = job.key.clone();
                        let beat = self
                            .blocking(move |w| w.resources.queue.heartbeat(&key, &w.worker_id))
                            .await;
                        if let Some(Err(e)) = beat {
                            warn!("Heartbeat for job {} failed: {}", job.key, e);
                        }
                        last_heartbeat = Instant::now();
                    }
                    if !abort_requested {
                        let key = job.key.clone();
                        let requested = self
                            .blocking(move |w| w.resources.queue.is_abort_requested(&key))
                            .await;
                        match requested {
                            Some(Ok(true)) => {
                                info!("Cancelling job {} on abort request", job.key);
                                abort_requested = true;
                                token.cancel();
                            }
                            Some(Ok(false)) | None => {}
                            Some(Err(e)) => debug!("Abort check for job {} failed: {}", job.key, e),
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Returned(Ok(result)) => {
                info!("Job {} completed in {:?}", job.key, started.elapsed());
                self.settle(job, "success", started, move |q, key| q.mark_complete(key, result))
                    .await;
            }
            Outcome::Returned(Err(e)) if abort_requested => {
                info!("Job {} aborted: {}", job.key, e);
                self.settle(job, "aborted", started, |q, key| q.mark_aborted(key))
                    .await;
            }
            Outcome::Returned(Err(e)) => {
                error!("Job {} failed after {:?}: {}", job.key, started.elapsed(), e);
                let text = e.job_error_text();
                self.settle(job, "failed", started, move |q, key| q.mark_failed(key, &text))
                    .await;
            }
            Outcome::Panicked(e) => {
                error!("Job {} panicked after {:?}: {}", job.key, started.elapsed(), e);
                let text = format!("Task panic: {}", e);
                self.settle(job, "panic", started, move |q, key| q.mark_failed(key, &text))
                    .await;
            }
            Outcome::TimedOut => {
                let text = TaskError::Timeout(job.timeout_secs).job_error_text();
                error!("Job {} ({}): {}", job.key, job.function, text);
                let job_key = job.key.clone();
                self.settle(job, "timeout", started, move |q, key| q.mark_failed(key, &text))
                    .await;
                // the slot stays taken until the handler thread really stops
                if !handle.is_finished() {
                    warn!("Handler of job {} ignores cancellation, waiting for it", job_key);
                }
                let _ = handle.await;
            }
        }
    }

    /// Record the final state of `job` through `mark`, off the async threads.
    async fn settle<F>(self: &Arc<Self>, job: Job, outcome: &'static str, started: Instant, mark: F)
    where
        F: FnOnce(&JobQueue, &str) -> Result<Job, QueueError> + Send + 'static,
    {
        self.blocking(move |w| {
            let marked = mark(&w.resources.queue, &job.key);
            w.finish(&job, marked, outcome, started);
        })
        .await;
    }

    fn finish(
        &self,
        job: &Job,
        marked: Result<Job, QueueError>,
        outcome: &str,
        started: Instant,
    ) {
        metrics::record_job_executed(&job.function, outcome, started.elapsed());
        match marked {
            Ok(finished) => {
                if finished.error.is_some() {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.complete.fetch_add(1, Ordering::Relaxed);
                }
                after_process(&finished, &self.resources.stats);
            }
            Err(QueueError::InvalidTransition { from, .. }) => {
                warn!(
                    "Job {} moved to {} while running, dropping its {} result",
                    job.key, from, outcome
                );
            }
            Err(e) => error!("Failed to record result of job {}: {}", job.key, e),
        }
        // the permit of this job is still held here
        metrics::set_running_jobs(self.running_jobs().saturating_sub(1));
    }

    fn recover_lost_jobs(&self) {
        match self.resources.queue.recover_lost_jobs() {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    info!("Recovered {} jobs from lost workers", jobs.len());
                }
                for job in &jobs {
                    after_process(job, &self.resources.stats);
                }
                self.counters
                    .recovered
                    .fetch_add(jobs.len() as u64, Ordering::Relaxed);
            }
            Err(e) => error!("Failed to recover lost jobs: {}", e),
        }
    }

    fn health_key(&self) -> String {
        self.resources.keys.key(WORKERS_DOMAIN, &[&self.worker_id])
    }

    fn write_health(&self) {
        let health = WorkerHealth {
            worker_id: self.worker_id.clone(),
            queue: self.resources.queue.name().to_string(),
            timestamp: Utc::now(),
            active_jobs: self.running_jobs(),
            concurrency_limit: self.resources.config.worker.concurrency,
            jobs_complete: self.counters.complete.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_recovered: self.counters.recovered.load(Ordering::Relaxed),
        };
        let ttl = self.resources.config.worker.health_check_interval() * 2;
        let written = serde_json::to_string(&health)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                self.resources
                    .kv
                    .set(&self.health_key(), &raw, Some(ttl))
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = written {
            error!("Failed to update worker health: {}", e);
        }
    }

    fn clear_health(&self) {
        if let Err(e) = self.resources.kv.delete(&self.health_key()) {
            warn!("Failed to remove worker health record: {}", e);
        }
    }

    async fn health_loop(self: &Arc<Self>) {
        let interval = self.resources.config.worker.health_check_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown_token.cancelled() => break,
            }
            self.blocking(|w| {
                w.write_health();
                w.recover_lost_jobs();
            })
            .await;
        }
    }
}
