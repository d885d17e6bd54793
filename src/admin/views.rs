use crate::cron::ScheduleInfo;
use crate::queue::{Job, JobStatus};
use crate::stats::FunctionStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Queue overview for dashboards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueInfo {
    pub name: String,
    /// Workers that published a health record for this queue.
    pub workers: usize,
    pub queued: usize,
    pub active: usize,
    pub scheduled: usize,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Function,
    Status,
    Started,
    Attempts,
}

impl SortKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(SortKey::Function),
            "status" => Some(SortKey::Status),
            "started" => Some(SortKey::Started),
            "attempts" => Some(SortKey::Attempts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }
}

/// Filter and ordering of [`super::AdminService::list_jobs`].
#[derive(Debug, Clone)]
pub struct JobListQuery {
    pub status: Option<JobStatus>,
    pub limit: usize,
    /// `None` keeps enqueue order.
    pub sort_by: Option<SortKey>,
    pub sort_order: SortOrder,
}

impl Default for JobListQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
            sort_by: None,
            sort_order: SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub key: String,
    pub function: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub has_error: bool,
}

impl JobSummary {
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            key: job.key.clone(),
            function: job.function.clone(),
            status: job.reported_status(now),
            attempts: job.attempts,
            queued_at: job.queued_at,
            scheduled_at: job.scheduled_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            progress: job.progress,
            has_error: job.error.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub kwargs: JsonValue,
    pub result: Option<JsonValue>,
    /// Error message without the trace.
    pub error: Option<String>,
    pub trace: Option<String>,
    pub timeout_secs: u64,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Active without a heartbeat for longer than the stuck threshold.
    pub is_stuck: bool,
    pub worker_id: Option<String>,
    pub retry_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub name: String,
    pub description: String,
}

/// Result of an admin write. Failures carry a message instead of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(job_key: impl Into<String>) -> Self {
        Self {
            success: true,
            job_key: Some(job_key.into()),
            error: None,
        }
    }

    pub fn failed(job_key: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            job_key: job_key.map(str::to_string),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SummaryStats {
    pub queued: usize,
    pub active: usize,
    pub scheduled: usize,
    pub functions: BTreeMap<String, FunctionStats>,
    pub totals: FunctionStats,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CronOverview {
    pub name: String,
    pub function: String,
    pub run_at_startup: bool,
    #[serde(flatten)]
    pub schedule: ScheduleInfo,
}
