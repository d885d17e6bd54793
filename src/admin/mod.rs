//! Read and control façade over the job queue and the stats recorder.
//!
//! Every operation returns data: backend failures become an `error` field,
//! an empty list or a failed [`ActionOutcome`], and are logged here.

mod views;

pub use views::{
    ActionOutcome, CronOverview, JobDetail, JobListQuery, JobSummary, QueueInfo, SortKey,
    SortOrder, SummaryStats, TaskInfo,
};

use crate::cron::{schedule_info, CronJobDefinition};
use crate::kv::{KeyBuilder, KeyValueStore, KvResult};
use crate::queue::{Job, JobQueue, JobStatus};
use crate::stats::StatsRecorder;
use crate::tasks::TRACE_MARKERS;
use crate::worker::{WorkerHealth, WorkerResources, WORKERS_DOMAIN};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NO_DESCRIPTION: &str = "No description";
const ADMIN_RETRY_REASON: &str = "Retried by admin";

pub struct AdminService {
    queue: Arc<JobQueue>,
    stats: StatsRecorder,
    kv: Arc<dyn KeyValueStore>,
    keys: KeyBuilder,
    stuck_threshold: Duration,
}

/// Split a stored error into its message and the trace after the first
/// trace marker.
pub fn split_error(text: &str) -> (String, Option<String>) {
    let position = TRACE_MARKERS
        .iter()
        .filter_map(|marker| text.find(marker))
        .min();
    match position {
        Some(at) => {
            let trace = text[at..].trim_start_matches('\n').to_string();
            (text[..at].to_string(), Some(trace))
        }
        None => (text.to_string(), None),
    }
}

fn compare(a: &Job, b: &Job, key: SortKey, now: DateTime<Utc>) -> Ordering {
    match key {
        SortKey::Function => a.function.cmp(&b.function),
        SortKey::Status => a
            .reported_status(now)
            .as_str()
            .cmp(b.reported_status(now).as_str()),
        SortKey::Started => a.started_at.cmp(&b.started_at),
        SortKey::Attempts => a.attempts.cmp(&b.attempts),
    }
}

impl AdminService {
    pub fn new(resources: &WorkerResources) -> Self {
        Self {
            queue: resources.queue.clone(),
            stats: resources.stats.clone(),
            kv: resources.kv.clone(),
            keys: resources.keys.clone(),
            stuck_threshold: resources.config.worker.stuck_threshold(),
        }
    }

    pub fn queue_info(&self) -> QueueInfo {
        let mut info = QueueInfo {
            name: self.queue.name().to_string(),
            ..Default::default()
        };
        let mut errors = Vec::new();

        match self.count_workers() {
            Ok(workers) => info.workers = workers,
            Err(e) => {
                warn!("Failed to count workers: {}", e);
                errors.push(format!("workers: {}", e));
            }
        }
        match self.queue.counts() {
            Ok(counts) => {
                info.queued = counts.queued;
                info.active = counts.active;
                info.scheduled = counts.scheduled;
                info.latency_ms = counts.latency_ms;
            }
            Err(e) => {
                warn!("Failed to read queue counts: {}", e);
                errors.push(format!("queue: {}", e));
            }
        }

        if !errors.is_empty() {
            info.error = Some(errors.join("; "));
        }
        info
    }

    fn count_workers(&self) -> KvResult<usize> {
        let keys = self.kv.scan(&self.keys.pattern(WORKERS_DOMAIN, "*"))?;
        let mut workers = 0;
        for key in keys {
            let Some(raw) = self.kv.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<WorkerHealth>(&raw) {
                Ok(health) if health.queue == self.queue.name() => workers += 1,
                Ok(_) => {}
                Err(e) => warn!("Ignoring unreadable worker record {}: {}", key, e),
            }
        }
        Ok(workers)
    }

    /// Jobs matching `query`, in enqueue order unless a sort key is given.
    pub fn list_jobs(&self, query: &JobListQuery) -> Vec<JobSummary> {
        let now = Utc::now();
        let matching = self
            .queue
            .iterate_jobs()
            .filter(|job| query.status.map_or(true, |s| job.reported_status(now) == s));

        let jobs: Vec<Job> = match query.sort_by {
            None => matching.take(query.limit).collect(),
            Some(key) => {
                let mut jobs: Vec<Job> = matching.collect();
                jobs.sort_by(|a, b| {
                    let ordering = compare(a, b, key, now);
                    match query.sort_order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                });
                jobs.truncate(query.limit);
                jobs
            }
        };

        jobs.iter().map(|job| JobSummary::from_job(job, now)).collect()
    }

    /// Full view of one job, `None` when it does not exist or cannot be read.
    pub fn job_detail(&self, key: &str) -> Option<JobDetail> {
        let job = match self.queue.get_job(key) {
            Ok(job) => job?,
            Err(e) => {
                warn!("Failed to load job {}: {}", key, e);
                return None;
            }
        };
        let now = Utc::now();
        let (error, trace) = match job.error.as_deref() {
            Some(text) => {
                let (message, trace) = split_error(text);
                (Some(message), trace)
            }
            None => (None, None),
        };
        let is_stuck = job.status == JobStatus::Active
            && job
                .heartbeat_at
                .or(job.started_at)
                .and_then(|at| (now - at).to_std().ok())
                .is_some_and(|silence| silence > self.stuck_threshold);

        Some(JobDetail {
            summary: JobSummary::from_job(&job, now),
            kwargs: job.kwargs,
            result: job.result,
            error,
            trace,
            timeout_secs: job.timeout_secs,
            heartbeat_at: job.heartbeat_at,
            is_stuck,
            worker_id: job.worker_id,
            retry_reason: job.retry_reason,
        })
    }

    /// Registered handlers sorted by name, with the first line of their
    /// description.
    pub fn available_tasks(&self) -> Vec<TaskInfo> {
        self.queue
            .registry()
            .iter()
            .map(|handler| {
                let description = handler
                    .description()
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .unwrap_or(NO_DESCRIPTION);
                TaskInfo {
                    name: handler.name().to_string(),
                    description: description.to_string(),
                }
            })
            .collect()
    }

    pub fn retry_job(&self, key: &str) -> ActionOutcome {
        let function = match self.queue.get_job(key) {
            Ok(Some(job)) => job.function,
            Ok(None) => return ActionOutcome::failed(Some(key), format!("Job not found: {}", key)),
            Err(e) => {
                warn!("Retry of job {} failed: {}", key, e);
                return ActionOutcome::failed(Some(key), e.to_string());
            }
        };
        match self.queue.retry(key, ADMIN_RETRY_REASON) {
            Ok(true) => {
                self.stats.increment_retried(&function);
                info!("Admin retried job {} ({})", key, function);
                ActionOutcome::ok(key)
            }
            Ok(false) => ActionOutcome::failed(Some(key), "Job changed concurrently, try again"),
            Err(e) => {
                warn!("Retry of job {} failed: {}", key, e);
                ActionOutcome::failed(Some(key), e.to_string())
            }
        }
    }

    pub fn abort_job(&self, key: &str) -> ActionOutcome {
        match self.queue.abort(key) {
            Ok(_) => ActionOutcome::ok(key),
            Err(e) => {
                warn!("Abort of job {} failed: {}", key, e);
                ActionOutcome::failed(Some(key), e.to_string())
            }
        }
    }

    pub fn enqueue_task(&self, function: &str, kwargs: JsonValue) -> ActionOutcome {
        match self.queue.enqueue(function, kwargs, None) {
            Ok(key) => {
                info!("Admin enqueued {} as job {}", function, key);
                ActionOutcome::ok(key)
            }
            Err(e) => {
                warn!("Admin enqueue of {} failed: {}", function, e);
                ActionOutcome::failed(None, e.to_string())
            }
        }
    }

    /// Live queue counts plus durable per-function totals.
    pub fn summary_stats(&self) -> SummaryStats {
        let mut summary = SummaryStats::default();
        let mut errors = Vec::new();

        match self.queue.counts() {
            Ok(counts) => {
                summary.queued = counts.queued;
                summary.active = counts.active;
                summary.scheduled = counts.scheduled;
            }
            Err(e) => {
                warn!("Failed to read queue counts: {}", e);
                errors.push(format!("queue: {}", e));
            }
        }
        match self.stats.try_get_stats() {
            Ok(stats) => {
                summary.functions = stats.functions;
                summary.totals = stats.totals;
                summary.success_rate = stats.success_rate;
            }
            Err(e) => {
                warn!("Failed to read function stats: {}", e);
                errors.push(format!("stats: {}", e));
            }
        }

        if !errors.is_empty() {
            summary.error = Some(errors.join("; "));
        }
        summary
    }

    /// Schedules of `definitions` evaluated now.
    pub fn cron_overview(&self, definitions: &[CronJobDefinition]) -> Vec<CronOverview> {
        let now = Utc::now();
        definitions
            .iter()
            .map(|def| CronOverview {
                name: def.name.clone(),
                function: def.function.clone(),
                run_at_startup: def.run_at_startup,
                schedule: schedule_info(def.schedule.as_str(), now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::test_support::UnavailableKvStore;
    use crate::tasks::{FnTask, TaskError, TaskRegistry};
    use crate::worker::test_support::test_resources;
    use serde_json::json;

    fn registry() -> TaskRegistry {
        TaskRegistry::new()
            .with(Arc::new(FnTask::new(
                "send_email",
                "Send one email.\n\nKwargs: to, subject.",
                |_, _| Ok(json!(null)),
            )))
            .with(Arc::new(FnTask::new("index_page", "", |_, _| {
                Err(TaskError::failed("boom"))
            })))
    }

    #[test]
    fn test_split_error_at_first_marker() {
        let (message, trace) = split_error("boom\n\nCaused by:\n    disk full");
        assert_eq!(message, "boom");
        assert_eq!(trace.as_deref(), Some("Caused by:\n    disk full"));

        let (message, trace) = split_error("plain failure");
        assert_eq!(message, "plain failure");
        assert!(trace.is_none());
    }

    #[test]
    fn test_available_tasks_sorted_with_first_line() {
        let (resources, _dir) = test_resources(registry());
        let admin = AdminService::new(&resources);
        assert_eq!(
            admin.available_tasks(),
            vec![
                TaskInfo {
                    name: "index_page".to_string(),
                    description: "No description".to_string(),
                },
                TaskInfo {
                    name: "send_email".to_string(),
                    description: "Send one email.".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_enqueue_unknown_function_fails() {
        let (resources, _dir) = test_resources(registry());
        let admin = AdminService::new(&resources);
        let outcome = admin.enqueue_task("nope", json!({}));
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unknown function"));
        assert!(admin.list_jobs(&JobListQuery::default()).is_empty());
    }

    #[test]
    fn test_list_jobs_filter_sort_and_limit() {
        let (resources, _dir) = test_resources(registry());
        let admin = AdminService::new(&resources);
        let first = admin.enqueue_task("send_email", json!({})).job_key.unwrap();
        let second = admin.enqueue_task("index_page", json!({})).job_key.unwrap();
        let third = admin.enqueue_task("send_email", json!({})).job_key.unwrap();

        let keys = |jobs: Vec<JobSummary>| jobs.into_iter().map(|j| j.key).collect::<Vec<_>>();

        assert_eq!(
            keys(admin.list_jobs(&JobListQuery::default())),
            vec![first.clone(), second.clone(), third.clone()]
        );
        assert_eq!(
            keys(admin.list_jobs(&JobListQuery {
                limit: 2,
                ..Default::default()
            })),
            vec![first.clone(), second.clone()]
        );
        let by_function = admin.list_jobs(&JobListQuery {
            sort_by: Some(SortKey::Function),
            sort_order: SortOrder::Desc,
            ..Default::default()
        });
        assert_eq!(by_function.last().unwrap().key, second);

        let claimed = resources.queue.dequeue("w").unwrap().unwrap();
        let active = admin.list_jobs(&JobListQuery {
            status: Some(JobStatus::Active),
            ..Default::default()
        });
        assert_eq!(keys(active), vec![claimed.key]);
    }

    #[test]
    fn test_job_detail_splits_trace_and_retry_counts() {
        let (resources, _dir) = test_resources(registry());
        let admin = AdminService::new(&resources);
        let key = admin.enqueue_task("index_page", json!({"page": 3})).job_key.unwrap();
        resources.queue.dequeue("w").unwrap().unwrap();
        resources
            .queue
            .mark_failed(&key, "boom\n\nStack backtrace:\n0: handler")
            .unwrap();

        let detail = admin.job_detail(&key).unwrap();
        assert_eq!(detail.summary.status, JobStatus::Failed);
        assert_eq!(detail.error.as_deref(), Some("boom"));
        assert_eq!(detail.trace.as_deref(), Some("Stack backtrace:\n0: handler"));
        assert_eq!(detail.kwargs, json!({"page": 3}));
        assert!(!detail.is_stuck);

        assert!(admin.retry_job(&key).success);
        let detail = admin.job_detail(&key).unwrap();
        assert_eq!(detail.summary.status, JobStatus::Queued);
        assert_eq!(detail.summary.attempts, 1);
        assert_eq!(resources.stats.get_function("index_page").retried, 1);

        // queued jobs cannot be retried
        assert!(!admin.retry_job(&key).success);
        assert!(admin.job_detail("missing").is_none());
        assert!(!admin.retry_job("missing").success);
    }

    #[test]
    fn test_abort_requires_active_job() {
        let (resources, _dir) = test_resources(registry());
        let admin = AdminService::new(&resources);
        let key = admin.enqueue_task("send_email", json!({})).job_key.unwrap();
        assert!(!admin.abort_job(&key).success);
        resources.queue.dequeue("w").unwrap().unwrap();
        assert!(admin.abort_job(&key).success);
        assert!(resources.queue.is_abort_requested(&key).unwrap());
    }

    #[test]
    fn test_queue_info_counts_workers_of_this_queue() {
        let (resources, _dir) = test_resources(registry());
        let admin = AdminService::new(&resources);
        for (id, queue) in [("a", "default"), ("b", "default"), ("c", "other")] {
            let health = WorkerHealth {
                worker_id: id.to_string(),
                queue: queue.to_string(),
                timestamp: Utc::now(),
                active_jobs: 0,
                concurrency_limit: 1,
                jobs_complete: 0,
                jobs_failed: 0,
                jobs_recovered: 0,
            };
            resources
                .kv
                .set(
                    &resources.keys.key(WORKERS_DOMAIN, &[id]),
                    &serde_json::to_string(&health).unwrap(),
                    None,
                )
                .unwrap();
        }
        admin.enqueue_task("send_email", json!({}));

        let info = admin.queue_info();
        assert_eq!(info.name, "default");
        assert_eq!(info.workers, 2);
        assert_eq!(info.queued, 1);
        assert!(info.error.is_none());
    }

    #[test]
    fn test_degraded_backend_reports_error_field() {
        let (resources, _dir) = test_resources(registry());
        let broken = WorkerResources::from_parts(
            resources.config.clone(),
            Arc::new(UnavailableKvStore),
            resources.download_stats.clone(),
            resources.registry().clone(),
        );
        let admin = AdminService::new(&broken);

        let summary = admin.summary_stats();
        assert!(summary.error.is_some());
        assert_eq!(summary.totals.complete, 0);

        let info = admin.queue_info();
        assert!(info.error.is_some());
        assert!(admin.list_jobs(&JobListQuery::default()).is_empty());
        assert!(!admin.enqueue_task("send_email", json!({})).success);
    }

    #[test]
    fn test_cron_overview() {
        let (resources, _dir) = test_resources(registry());
        let admin = AdminService::new(&resources);
        let defs = vec![CronJobDefinition::new("weekly", "send_email", "0 6 * * 0").unwrap()];
        let overview = admin.cron_overview(&defs);
        assert_eq!(overview[0].schedule.description, "Weekly on Sunday at 6:00");
        assert!(overview[0].schedule.next_run.is_some());
    }
}
