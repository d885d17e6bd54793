use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Snapshot of one per-day counter, as written to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub entity_id: String,
    pub day: NaiveDate,
    pub count: i64,
}

/// Bookkeeping of one flush job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keys_scanned: usize,
    pub rows_written: usize,
}
