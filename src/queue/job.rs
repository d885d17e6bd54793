use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Stored and reported job states.
///
/// `Scheduled` is never stored: it is how readers report a queued job whose
/// `scheduled_at` is still in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Scheduled,
    Active,
    Complete,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Active => "active",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "scheduled" => Some(JobStatus::Scheduled),
            "active" | "in_progress" => Some(JobStatus::Active),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            "aborted" => Some(JobStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Aborted
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: String,
    pub function: String,
    #[serde(default)]
    pub kwargs: JsonValue,
    pub status: JobStatus,
    /// Number of explicit retries.
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message, followed by the trace when one was captured.
    pub error: Option<String>,
    pub result: Option<JsonValue>,
    pub timeout_secs: u64,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub worker_id: Option<String>,
    pub retry_reason: Option<String>,
}

impl Job {
    pub fn new(
        key: String,
        function: String,
        kwargs: JsonValue,
        scheduled_at: Option<DateTime<Utc>>,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            function,
            kwargs,
            status: JobStatus::Queued,
            attempts: 0,
            queued_at: now,
            scheduled_at,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            // a partial second rounds up
            timeout_secs: timeout
                .as_secs()
                .saturating_add(u64::from(timeout.subsec_nanos() > 0)),
            heartbeat_at: None,
            progress: 0,
            worker_id: None,
            retry_reason: None,
        }
    }

    /// Status as readers see it at `now`.
    pub fn reported_status(&self, now: DateTime<Utc>) -> JobStatus {
        match (self.status, self.scheduled_at) {
            (JobStatus::Queued, Some(at)) if at > now => JobStatus::Scheduled,
            (status, _) => status,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Moment the job becomes eligible for dequeue.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.queued_at)
    }
}

/// Optional knobs for [`super::JobQueue::enqueue_with`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Explicit job key. An existing key makes the enqueue fail with
    /// `DuplicateJob`.
    pub job_key: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn at(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.job_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Compact view for producers polling a job they enqueued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub result: Option<JsonValue>,
}
