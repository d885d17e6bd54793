//! Durable storage for flushed per-day download counts.

mod models;
mod schema;
mod sqlite_download_stats_store;

pub use models::{DailyCount, FlushRun};
pub use schema::DOWNLOAD_STATS_VERSIONED_SCHEMAS;
pub use sqlite_download_stats_store::SqliteDownloadStatsStore;

use anyhow::Result;
use chrono::NaiveDate;

/// Relational store the flush job writes to.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait DownloadStatsStore: Send + Sync {
    /// Upsert a batch of snapshots in one transaction. A row only changes when
    /// the snapshot is larger than what is stored. Returns rows written.
    fn record_daily_counts(&self, counts: &[DailyCount]) -> Result<usize>;

    fn get_daily_count(&self, entity_id: &str, day: NaiveDate) -> Result<Option<i64>>;

    /// Sum of counts for `entity_id` over `[from, to]`.
    fn get_entity_total(&self, entity_id: &str, from: NaiveDate, to: NaiveDate) -> Result<i64>;

    /// Entities with the highest summed counts over `[from, to]`.
    fn top_entities(&self, from: NaiveDate, to: NaiveDate, limit: usize)
        -> Result<Vec<(String, i64)>>;

    fn row_count(&self) -> Result<usize>;

    fn record_flush_run(&self, run: &FlushRun) -> Result<()>;

    fn recent_flush_runs(&self, limit: usize) -> Result<Vec<FlushRun>>;

    /// Flush pending writes before the process exits.
    fn close(&self) {}
}
