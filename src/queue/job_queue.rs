use super::job::{EnqueueOptions, Job, JobStatus, JobStatusView};
use super::QueueError;
use crate::kv::{KeyBuilder, KeyValueStore, KvResult};
use crate::tasks::TaskRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Compare-and-set rounds before a concurrent update gives up.
const CAS_ATTEMPTS: usize = 8;

/// Pending entries inspected per dequeue call.
const CLAIM_BATCH: usize = 16;

/// Timeouts are stored in whole seconds.
const MIN_TIMEOUT: Duration = Duration::from_secs(1);

pub const LOST_WORKER_ERROR: &str = "Worker lost while the job was active";
pub const ABORTED_ERROR: &str = "Job aborted";

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub default_timeout: Duration,
    /// How long finished job records are kept.
    pub keep_result: Duration,
    /// Lifetime of a claim lock between heartbeats.
    pub lock_ttl: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            default_timeout: Duration::from_secs(300),
            keep_result: Duration::from_secs(86400),
            lock_ttl: Duration::from_secs(30),
        }
    }
}

/// Live queue sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub scheduled: usize,
    pub active: usize,
    /// Wait time of the oldest due job, in milliseconds.
    pub latency_ms: u64,
}

pub struct JobQueue {
    kv: Arc<dyn KeyValueStore>,
    keys: KeyBuilder,
    settings: QueueSettings,
    registry: Arc<TaskRegistry>,
}

fn millis(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64
}

fn require(job: &Job, allowed: &[JobStatus], operation: &'static str) -> Result<(), QueueError> {
    if allowed.contains(&job.status) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            key: job.key.clone(),
            from: job.status,
            operation,
        })
    }
}

impl JobQueue {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        keys: KeyBuilder,
        settings: QueueSettings,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            kv,
            keys,
            settings,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    fn domain(&self) -> String {
        format!("queue:{}", self.settings.name)
    }

    fn record_key(&self, key: &str) -> String {
        self.keys.key(&self.domain(), &["jobs", key])
    }

    fn lock_key(&self, key: &str) -> String {
        self.keys.key(&self.domain(), &["in_progress", key])
    }

    fn abort_key(&self, key: &str) -> String {
        self.keys.key(&self.domain(), &["abort", key])
    }

    fn pending_key(&self) -> String {
        self.keys.key(&self.domain(), &["pending"])
    }

    fn active_key(&self) -> String {
        self.keys.key(&self.domain(), &["active"])
    }

    fn index_key(&self) -> String {
        self.keys.key(&self.domain(), &["index"])
    }

    fn sequence_key(&self) -> String {
        self.keys.key(&self.domain(), &["sequence"])
    }

    /// Enqueue `function` to run now, or at `run_at` when that is in the future.
    pub fn enqueue(
        &self,
        function: &str,
        kwargs: JsonValue,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<String, QueueError> {
        self.enqueue_with(
            function,
            kwargs,
            EnqueueOptions {
                run_at,
                ..Default::default()
            },
        )
    }

    pub fn enqueue_with(
        &self,
        function: &str,
        kwargs: JsonValue,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        if !self.registry.contains(function) {
            return Err(QueueError::UnknownFunction(function.to_string()));
        }

        let now = Utc::now();
        let key = options
            .job_key
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let scheduled_at = options.run_at.filter(|at| *at > now);
        let timeout = options.timeout.unwrap_or(self.settings.default_timeout);
        if timeout < MIN_TIMEOUT {
            return Err(QueueError::InvalidTimeout(timeout));
        }
        let job = Job::new(
            key.clone(),
            function.to_string(),
            kwargs,
            scheduled_at,
            timeout,
            now,
        );

        let record_key = self.record_key(&key);
        let raw = serde_json::to_string(&job)?;
        if !self.kv.set_nx(&record_key, &raw, None)? {
            return Err(QueueError::DuplicateJob(key));
        }

        if let Err(e) = self.index_new_job(&job) {
            // leave nothing behind from a half-written enqueue
            let _ = self.kv.zrem(&self.index_key(), &key);
            let _ = self.kv.zrem(&self.pending_key(), &key);
            let _ = self.kv.delete(&record_key);
            return Err(e.into());
        }

        debug!(
            "Enqueued job {} ({}) due at {}",
            key,
            function,
            job.due_at()
        );
        Ok(key)
    }

    fn index_new_job(&self, job: &Job) -> KvResult<()> {
        let sequence = self.kv.incr_by(&self.sequence_key(), 1)?;
        self.kv.zadd(&self.index_key(), &job.key, sequence as f64)?;
        self.kv
            .zadd(&self.pending_key(), &job.key, millis(job.due_at()))
    }

    pub fn get_job(&self, key: &str) -> Result<Option<Job>, QueueError> {
        match self.kv.get(&self.record_key(key))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn job_status(&self, key: &str) -> Result<Option<JobStatusView>, QueueError> {
        let now = Utc::now();
        Ok(self.get_job(key)?.map(|job| JobStatusView {
            status: job.reported_status(now),
            attempts: job.attempts,
            error: job.error,
            result: job.result,
        }))
    }

    /// Lazily walk every known job in enqueue order.
    ///
    /// The key list is captured when called; records that expire or fail to
    /// load during the walk are skipped. Call again for a fresh snapshot.
    pub fn iterate_jobs(&self) -> JobIter<'_> {
        let keys: Vec<String> = match self.kv.zrange_by_score(
            &self.index_key(),
            f64::NEG_INFINITY,
            f64::INFINITY,
            usize::MAX,
        ) {
            Ok(entries) => entries.into_iter().map(|(key, _)| key).collect(),
            Err(e) => {
                warn!("Failed to read job index: {}", e);
                Vec::new()
            }
        };
        JobIter {
            queue: self,
            keys: keys.into_iter(),
        }
    }

    /// Read-modify-write of a job record through compare-and-set.
    fn update<F>(&self, key: &str, ttl: Option<Duration>, mut apply: F) -> Result<Job, QueueError>
    where
        F: FnMut(&mut Job) -> Result<(), QueueError>,
    {
        let record_key = self.record_key(key);
        for _ in 0..CAS_ATTEMPTS {
            let raw = self
                .kv
                .get(&record_key)?
                .ok_or_else(|| QueueError::NotFound(key.to_string()))?;
            let mut job: Job = serde_json::from_str(&raw)?;
            apply(&mut job)?;
            let updated = serde_json::to_string(&job)?;
            if self.kv.compare_and_set(&record_key, &raw, &updated, ttl)? {
                return Ok(job);
            }
        }
        Err(QueueError::Conflict(key.to_string()))
    }

    /// Move a failed or aborted job back to queued and count the attempt.
    ///
    /// An active job whose claim lock has expired is retryable too. Returns
    /// false when the record kept changing underneath the retry.
    pub fn retry(&self, key: &str, reason: &str) -> Result<bool, QueueError> {
        let lock_key = self.lock_key(key);
        let outcome = self.update(key, None, |job| {
            match job.status {
                JobStatus::Failed | JobStatus::Aborted => {}
                JobStatus::Active if self.kv.get(&lock_key)?.is_none() => {}
                _ => require(job, &[JobStatus::Failed, JobStatus::Aborted], "retry")?,
            }
            job.status = JobStatus::Queued;
            job.attempts += 1;
            job.error = None;
            job.result = None;
            job.scheduled_at = None;
            job.started_at = None;
            job.completed_at = None;
            job.heartbeat_at = None;
            job.progress = 0;
            job.worker_id = None;
            job.retry_reason = Some(reason.to_string());
            Ok(())
        });

        match outcome {
            Ok(job) => {
                self.kv.zrem(&self.active_key(), key)?;
                self.kv.delete(&self.abort_key(key))?;
                self.kv
                    .zadd(&self.pending_key(), key, millis(Utc::now()))?;
                info!(
                    "Retrying job {} ({}), attempt {}: {}",
                    key, job.function, job.attempts, reason
                );
                Ok(true)
            }
            Err(QueueError::Conflict(_)) => {
                warn!("Retry of job {} lost to concurrent updates", key);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask the worker running `key` to stop. Only valid while active.
    pub fn abort(&self, key: &str) -> Result<bool, QueueError> {
        let job = self
            .get_job(key)?
            .ok_or_else(|| QueueError::NotFound(key.to_string()))?;
        require(&job, &[JobStatus::Active], "abort")?;
        self.kv
            .set(&self.abort_key(key), "1", Some(self.settings.keep_result))?;
        info!("Abort requested for job {} ({})", key, job.function);
        Ok(true)
    }

    pub fn is_abort_requested(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.kv.get(&self.abort_key(key))?.is_some())
    }

    /// Claim one due job for `worker_id` and mark it active.
    pub fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let pending_key = self.pending_key();
        let due = self
            .kv
            .zrange_by_score(&pending_key, f64::NEG_INFINITY, millis(now), CLAIM_BATCH)?;

        for (key, score) in due {
            let lock_key = self.lock_key(&key);
            if !self
                .kv
                .set_nx(&lock_key, worker_id, Some(self.settings.lock_ttl))?
            {
                continue;
            }
            if !self.kv.zrem(&pending_key, &key)? {
                // claimed and released by another worker since the range read
                self.kv.delete(&lock_key)?;
                continue;
            }

            let claimed = self.update(&key, None, |job| {
                require(job, &[JobStatus::Queued], "dequeue")?;
                job.status = JobStatus::Active;
                job.started_at = Some(now);
                job.heartbeat_at = Some(now);
                job.progress = 0;
                job.worker_id = Some(worker_id.to_string());
                Ok(())
            });

            match claimed {
                Ok(job) => {
                    self.kv.zadd(&self.active_key(), &key, millis(now))?;
                    return Ok(Some(job));
                }
                Err(QueueError::NotFound(_)) => {
                    debug!("Dropping pending entry of expired job {}", key);
                    self.kv.delete(&lock_key)?;
                }
                Err(QueueError::InvalidTransition { from, .. }) => {
                    warn!("Pending job {} was {}, skipping", key, from);
                    self.kv.delete(&lock_key)?;
                }
                Err(QueueError::Serialization(e)) => {
                    error!("Dropping unreadable job record {}: {}", key, e);
                    self.kv.delete(&lock_key)?;
                }
                Err(e) => {
                    let _ = self.kv.zadd(&pending_key, &key, score);
                    let _ = self.kv.delete(&lock_key);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    fn finish<F>(
        &self,
        key: &str,
        status: JobStatus,
        operation: &'static str,
        mut apply: F,
    ) -> Result<Job, QueueError>
    where
        F: FnMut(&mut Job),
    {
        let now = Utc::now();
        let job = self.update(key, Some(self.settings.keep_result), |job| {
            require(job, &[JobStatus::Active], operation)?;
            job.status = status;
            job.completed_at = Some(now);
            apply(job);
            Ok(())
        })?;
        self.release(key);
        Ok(job)
    }

    fn release(&self, key: &str) {
        let cleanup = self
            .kv
            .zrem(&self.active_key(), key)
            .and_then(|_| self.kv.delete(&self.lock_key(key)))
            .and_then(|_| self.kv.delete(&self.abort_key(key)));
        if let Err(e) = cleanup {
            warn!("Failed to release job {}: {}", key, e);
        }
    }

    pub fn mark_complete(&self, key: &str, result: JsonValue) -> Result<Job, QueueError> {
        self.finish(key, JobStatus::Complete, "complete", |job| {
            job.progress = 100;
            job.result = Some(result.clone());
        })
    }

    pub fn mark_failed(&self, key: &str, error: &str) -> Result<Job, QueueError> {
        self.finish(key, JobStatus::Failed, "fail", |job| {
            job.error = Some(error.to_string());
        })
    }

    pub fn mark_aborted(&self, key: &str) -> Result<Job, QueueError> {
        self.finish(key, JobStatus::Aborted, "abort", |job| {
            job.error = Some(ABORTED_ERROR.to_string());
        })
    }

    /// Refresh the heartbeat timestamp and the claim lock of an active job.
    pub fn heartbeat(&self, key: &str, worker_id: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        self.update(key, None, |job| {
            require(job, &[JobStatus::Active], "heartbeat")?;
            job.heartbeat_at = Some(now);
            Ok(())
        })?;
        let lock_key = self.lock_key(key);
        if !self.kv.expire(&lock_key, self.settings.lock_ttl)? {
            self.kv
                .set_nx(&lock_key, worker_id, Some(self.settings.lock_ttl))?;
        }
        Ok(())
    }

    pub fn set_progress(&self, key: &str, percent: u8) -> Result<(), QueueError> {
        self.update(key, None, |job| {
            require(job, &[JobStatus::Active], "report progress on")?;
            job.progress = percent.min(100);
            Ok(())
        })
        .map(|_| ())
    }

    /// Fail active jobs whose claim lock expired, i.e. whose worker stopped
    /// heartbeating. Returns the jobs that were failed.
    pub fn recover_lost_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let active_key = self.active_key();
        let active =
            self.kv
                .zrange_by_score(&active_key, f64::NEG_INFINITY, f64::INFINITY, usize::MAX)?;

        let mut recovered = Vec::new();
        for (key, _) in active {
            if self.kv.get(&self.lock_key(&key))?.is_some() {
                continue;
            }
            match self.mark_failed(&key, LOST_WORKER_ERROR) {
                Ok(job) => {
                    warn!("Marked job {} ({}) as failed: worker lost", key, job.function);
                    recovered.push(job);
                }
                Err(QueueError::NotFound(_)) | Err(QueueError::InvalidTransition { .. }) => {
                    self.kv.zrem(&active_key, &key)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Drop index and pending entries whose job record has expired.
    pub fn purge_expired(&self) -> Result<usize, QueueError> {
        let index_key = self.index_key();
        let entries =
            self.kv
                .zrange_by_score(&index_key, f64::NEG_INFINITY, f64::INFINITY, usize::MAX)?;
        let mut purged = 0;
        for (key, _) in entries {
            if self.kv.get(&self.record_key(&key))?.is_some() {
                continue;
            }
            self.kv.zrem(&index_key, &key)?;
            self.kv.zrem(&self.pending_key(), &key)?;
            purged += 1;
        }
        Ok(purged)
    }

    pub fn counts(&self) -> Result<QueueCounts, QueueError> {
        let now = millis(Utc::now());
        let pending_key = self.pending_key();
        let due = self
            .kv
            .zrange_by_score(&pending_key, f64::NEG_INFINITY, now, usize::MAX)?;
        let pending = self.kv.zcard(&pending_key)?;
        let active = self.kv.zcard(&self.active_key())?;
        let latency_ms = due
            .first()
            .map(|(_, score)| (now - score).max(0.0) as u64)
            .unwrap_or(0);
        Ok(QueueCounts {
            queued: due.len(),
            scheduled: pending.saturating_sub(due.len()),
            active,
            latency_ms,
        })
    }
}

/// Iterator returned by [`JobQueue::iterate_jobs`].
pub struct JobIter<'a> {
    queue: &'a JobQueue,
    keys: std::vec::IntoIter<String>,
}

impl Iterator for JobIter<'_> {
    type Item = Job;

    fn next(&mut self) -> Option<Job> {
        for key in self.keys.by_ref() {
            match self.queue.get_job(&key) {
                Ok(Some(job)) => return Some(job),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping job {}: {}", key, e);
                    continue;
                }
            }
        }
        None
    }
}
