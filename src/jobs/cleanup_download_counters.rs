//! Evicts per-day download counters older than the retention window.
//!
//! Eviction ignores whether a key was flushed. Running the flush more often
//! than this job is what keeps data from being lost.

use crate::counters::{CounterStore, DAILY_DOWNLOADS_NAMESPACE};
use crate::metrics;
use crate::tasks::{TaskContext, TaskError, TaskHandler};
use chrono::{Days, NaiveDate, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

pub const FUNCTION_NAME: &str = "cleanup_download_counters";

pub struct CleanupDownloadCounters;

impl TaskHandler for CleanupDownloadCounters {
    fn name(&self) -> &'static str {
        FUNCTION_NAME
    }

    fn description(&self) -> &'static str {
        "Delete daily download counters older than the retention window.\n\
         Accepts an optional `retention_days` argument."
    }

    fn execute(&self, ctx: &TaskContext, kwargs: &JsonValue) -> Result<JsonValue, TaskError> {
        let retention_days = match kwargs.get("retention_days") {
            None | Some(JsonValue::Null) => ctx.resources.config.counters.retention_days,
            Some(value) => value.as_u64().ok_or_else(|| {
                TaskError::InvalidArguments(format!(
                    "retention_days must be a non-negative integer, got {}",
                    value
                ))
            })?,
        };
        ctx.check_cancelled()?;

        let today = Utc::now().date_naive();
        let evicted = evict_stale(&ctx.resources.counters, retention_days, today)?;
        Ok(json!({ "evicted": evicted, "retention_days": retention_days }))
    }
}

/// First day still inside the window ending at `today`.
pub fn retention_cutoff(today: NaiveDate, retention_days: u64) -> NaiveDate {
    today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(NaiveDate::MIN)
}

/// Delete daily download keys whose day falls before the retention cutoff.
pub fn evict_stale(
    counters: &CounterStore,
    retention_days: u64,
    today: NaiveDate,
) -> Result<usize, TaskError> {
    let cutoff = retention_cutoff(today, retention_days);
    let keys = counters
        .daily_keys(DAILY_DOWNLOADS_NAMESPACE)
        .map_err(|e| TaskError::failed(format!("Failed to scan daily counters: {}", e)))?;

    let mut evicted = 0;
    for daily in keys.iter().filter(|k| k.day < cutoff) {
        match counters.delete_key(&daily.key) {
            Ok(true) => evicted += 1,
            Ok(false) => debug!("Counter {} already gone", daily.key),
            Err(e) => {
                return Err(TaskError::failed(format!(
                    "Failed to delete counter {}: {}",
                    daily.key, e
                )))
            }
        }
    }

    metrics::record_keys_evicted(evicted);
    info!(
        "Evicted {} daily counters older than {} ({} scanned)",
        evicted,
        cutoff,
        keys.len()
    );
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KeyBuilder, MemoryKvStore};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_cutoff() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(
            retention_cutoff(today, 7),
            NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()
        );
        assert_eq!(retention_cutoff(today, 0), today);
    }

    #[test]
    fn test_never_evicts_inside_window() {
        let counters = CounterStore::new(Arc::new(MemoryKvStore::new()), KeyBuilder::new("t"));
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        for offset in 0..10u64 {
            let day = today.checked_sub_days(Days::new(offset)).unwrap();
            counters.increment_daily(
                DAILY_DOWNLOADS_NAMESPACE,
                "song-1",
                day,
                Duration::from_secs(3600),
            );
        }

        assert_eq!(evict_stale(&counters, 7, today).unwrap(), 2);

        let remaining: Vec<_> = counters
            .daily_keys(DAILY_DOWNLOADS_NAMESPACE)
            .unwrap()
            .into_iter()
            .map(|k| k.day)
            .collect();
        assert_eq!(remaining.len(), 8);
        assert!(remaining
            .iter()
            .all(|day| *day >= NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()));

        assert_eq!(evict_stale(&counters, 7, today).unwrap(), 0);
    }
}
