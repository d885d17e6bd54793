use super::expression::{truncate_to_minute, CronError, CronExpression};
use crate::metrics;
use crate::queue::{EnqueueOptions, JobQueue, QueueError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ticks replayed after the scheduler wakes up late.
const MAX_CATCH_UP_TICKS: i64 = 5;

/// A recurring job, fixed at process start.
#[derive(Debug, Clone)]
pub struct CronJobDefinition {
    pub name: String,
    pub function: String,
    pub schedule: CronExpression,
    pub timeout: Option<Duration>,
    pub kwargs: JsonValue,
    /// Also enqueue once when the scheduler starts.
    pub run_at_startup: bool,
}

impl CronJobDefinition {
    pub fn new(
        name: impl Into<String>,
        function: impl Into<String>,
        expression: &str,
    ) -> Result<Self, CronError> {
        Ok(Self {
            name: name.into(),
            function: function.into(),
            schedule: CronExpression::parse(expression)?,
            timeout: None,
            kwargs: JsonValue::Object(Default::default()),
            run_at_startup: false,
        })
    }

    pub fn with_kwargs(mut self, kwargs: JsonValue) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn run_at_startup(mut self) -> Self {
        self.run_at_startup = true;
        self
    }

    /// Dedupe key for the tick starting at `tick`. Identical across workers.
    pub fn job_key(&self, tick: DateTime<Utc>) -> String {
        format!("cron:{}:{}", self.name, tick.timestamp() / 60)
    }
}

/// Enqueues recurring jobs once per minute.
///
/// Several worker processes may run a scheduler against the same queue: the
/// per-tick job key makes the second enqueue of a tick a `DuplicateJob`.
pub struct CronScheduler {
    queue: Arc<JobQueue>,
    definitions: Vec<CronJobDefinition>,
    shutdown_token: CancellationToken,
}

impl CronScheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        definitions: Vec<CronJobDefinition>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            queue,
            definitions,
            shutdown_token,
        }
    }

    pub fn definitions(&self) -> &[CronJobDefinition] {
        &self.definitions
    }

    pub async fn run(self) {
        info!(
            "Starting cron scheduler with {} definitions",
            self.definitions.len()
        );
        for def in &self.definitions {
            match def.schedule.next_after(Utc::now()) {
                Some(next) => info!("  {} ({}) next run at {}", def.name, def.schedule, next),
                None => warn!("  {} ({}) never runs", def.name, def.schedule),
            }
        }

        let mut last_tick = truncate(Utc::now());
        self.run_startup(last_tick);

        loop {
            let now = Utc::now();
            let next_tick = last_tick + ChronoDuration::minutes(1);
            let sleep_for = (next_tick - now).to_std().unwrap_or(Duration::ZERO);
            debug!("Cron scheduler sleeping for {:?}", sleep_for);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.shutdown_token.cancelled() => {
                    info!("Cron scheduler received shutdown signal");
                    break;
                }
            }

            let current = truncate(Utc::now());
            let missed = (current - last_tick).num_minutes();
            if missed > MAX_CATCH_UP_TICKS {
                warn!("Cron scheduler fell {} minutes behind, skipping ahead", missed);
                last_tick = current - ChronoDuration::minutes(MAX_CATCH_UP_TICKS);
            }
            while last_tick < current {
                last_tick += ChronoDuration::minutes(1);
                self.tick(last_tick);
            }
        }
    }

    fn run_startup(&self, tick: DateTime<Utc>) {
        for def in self.definitions.iter().filter(|d| d.run_at_startup) {
            info!("Enqueueing {} at startup", def.name);
            self.enqueue(def, format!("cron:{}:startup:{}", def.name, tick.timestamp() / 60));
        }
    }

    /// Enqueue every definition matching `tick`. Returns the enqueued job keys.
    pub fn tick(&self, tick: DateTime<Utc>) -> Vec<String> {
        let tick = truncate(tick);
        self.definitions
            .iter()
            .filter(|def| def.schedule.matches(tick))
            .filter_map(|def| self.enqueue(def, def.job_key(tick)))
            .collect()
    }

    fn enqueue(&self, def: &CronJobDefinition, job_key: String) -> Option<String> {
        let options = EnqueueOptions {
            job_key: Some(job_key.clone()),
            run_at: None,
            timeout: def.timeout,
        };
        match self
            .queue
            .enqueue_with(&def.function, def.kwargs.clone(), options)
        {
            Ok(key) => {
                info!("Cron {} enqueued job {}", def.name, key);
                metrics::record_cron_enqueue(&def.name);
                Some(key)
            }
            Err(QueueError::DuplicateJob(_)) => {
                debug!("Cron {} already enqueued as {}", def.name, job_key);
                None
            }
            Err(e) => {
                error!("Cron {} failed to enqueue {}: {}", def.name, def.function, e);
                None
            }
        }
    }
}

fn truncate(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t.naive_utc()).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KeyBuilder, MemoryKvStore};
    use crate::queue::QueueSettings;
    use crate::tasks::{FnTask, TaskRegistry};
    use chrono::TimeZone;
    use serde_json::json;

    fn queue() -> Arc<JobQueue> {
        let registry = TaskRegistry::new()
            .with(Arc::new(FnTask::new("flush", "", |_, _| Ok(json!(null)))))
            .with(Arc::new(FnTask::new("report", "", |_, _| Ok(json!(null)))));
        Arc::new(JobQueue::new(
            Arc::new(MemoryKvStore::new()),
            KeyBuilder::new("test"),
            QueueSettings::default(),
            Arc::new(registry),
        ))
    }

    fn definitions() -> Vec<CronJobDefinition> {
        vec![
            CronJobDefinition::new("flush-downloads", "flush", "*/10 * * * *")
                .unwrap()
                .with_timeout(Duration::from_secs(60))
                .with_kwargs(json!({"batch": 100})),
            CronJobDefinition::new("weekly-report", "report", "0 6 * * 0").unwrap(),
        ]
    }

    #[test]
    fn test_tick_enqueues_matching_definitions_once() {
        let queue = queue();
        let scheduler = CronScheduler::new(queue.clone(), definitions(), CancellationToken::new());
        let tick = Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 0).unwrap();

        let keys = scheduler.tick(tick);
        assert_eq!(keys.len(), 1);
        let job = queue.get_job(&keys[0]).unwrap().unwrap();
        assert_eq!(job.function, "flush");
        assert_eq!(job.kwargs, json!({"batch": 100}));
        assert_eq!(job.timeout_secs, 60);

        // a second scheduler on the same tick is deduplicated
        let other = CronScheduler::new(queue.clone(), definitions(), CancellationToken::new());
        assert!(other.tick(tick + ChronoDuration::seconds(30)).is_empty());
        assert_eq!(queue.iterate_jobs().count(), 1);
    }

    #[test]
    fn test_tick_without_matches() {
        let scheduler = CronScheduler::new(queue(), definitions(), CancellationToken::new());
        let tick = Utc.with_ymd_and_hms(2024, 3, 1, 10, 21, 0).unwrap();
        assert!(scheduler.tick(tick).is_empty());
    }

    #[test]
    fn test_unregistered_function_is_logged_not_enqueued() {
        let queue = queue();
        let defs = vec![CronJobDefinition::new("ghost", "missing", "* * * * *").unwrap()];
        let scheduler = CronScheduler::new(queue.clone(), defs, CancellationToken::new());
        assert!(scheduler.tick(Utc::now()).is_empty());
        assert_eq!(queue.iterate_jobs().count(), 0);
    }

    #[test]
    fn test_job_key_is_per_minute() {
        let def = CronJobDefinition::new("flush", "flush", "* * * * *").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 0).unwrap();
        assert_eq!(def.job_key(t), def.job_key(t + ChronoDuration::seconds(59)));
        assert_ne!(def.job_key(t), def.job_key(t + ChronoDuration::minutes(1)));
    }

    #[tokio::test]
    async fn test_startup_definitions_run_and_shutdown_stops_loop() {
        let queue = queue();
        let token = CancellationToken::new();
        let defs = vec![CronJobDefinition::new("report-now", "report", "0 0 1 1 *")
            .unwrap()
            .run_at_startup()];
        let scheduler = CronScheduler::new(queue.clone(), defs, token.clone());

        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let jobs: Vec<_> = queue.iterate_jobs().collect();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].function, "report");
        assert!(jobs[0].key.starts_with("cron:report-now:startup:"));
    }
}
