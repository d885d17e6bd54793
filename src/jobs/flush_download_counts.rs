//! Copies per-day download counters into the durable stats store.
//!
//! Counters are read as snapshots and never reset. Each scan batch is written
//! in its own transaction, after all of its values were read.

use crate::counters::{CounterStore, DAILY_DOWNLOADS_NAMESPACE};
use crate::download_stats::{DailyCount, DownloadStatsStore, FlushRun};
use crate::metrics;
use crate::tasks::{TaskContext, TaskError, TaskHandler};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub const FUNCTION_NAME: &str = "flush_download_counts";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub keys_scanned: usize,
    /// Rows with a positive count handed to the durable store.
    pub rows_flushed: usize,
    /// Rows the durable store actually inserted or grew.
    pub rows_written: usize,
    pub batches: usize,
}

pub struct FlushDownloadCounts;

impl TaskHandler for FlushDownloadCounts {
    fn name(&self) -> &'static str {
        FUNCTION_NAME
    }

    fn description(&self) -> &'static str {
        "Flush daily download counters to the stats database.\n\
         Accepts an optional `batch_size` argument."
    }

    fn execute(&self, ctx: &TaskContext, kwargs: &JsonValue) -> Result<JsonValue, TaskError> {
        let resources = &ctx.resources;
        let batch_size = match kwargs.get("batch_size") {
            None | Some(JsonValue::Null) => resources.config.counters.flush_batch_size,
            Some(value) => value
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    TaskError::InvalidArguments(format!("batch_size must be positive, got {}", value))
                })? as usize,
        };

        let started_at = Utc::now();
        let report = flush(
            ctx,
            &resources.counters,
            resources.download_stats.as_ref(),
            batch_size,
        )?;

        let run = FlushRun {
            started_at,
            finished_at: Utc::now(),
            keys_scanned: report.keys_scanned,
            rows_written: report.rows_written,
        };
        if let Err(e) = resources.download_stats.record_flush_run(&run) {
            warn!("Failed to record flush run: {}", e);
        }

        serde_json::to_value(&report).map_err(|e| TaskError::failed(e.to_string()))
    }
}

/// One pass over every daily download key.
pub fn flush(
    ctx: &TaskContext,
    counters: &CounterStore,
    store: &dyn DownloadStatsStore,
    batch_size: usize,
) -> Result<FlushReport, TaskError> {
    let keys = counters
        .daily_keys(DAILY_DOWNLOADS_NAMESPACE)
        .map_err(|e| TaskError::failed(format!("Failed to scan daily counters: {}", e)))?;

    let mut report = FlushReport {
        keys_scanned: keys.len(),
        ..Default::default()
    };

    for chunk in keys.chunks(batch_size.max(1)) {
        ctx.check_cancelled()?;

        let mut batch = Vec::with_capacity(chunk.len());
        for daily in chunk {
            let value = counters.read_raw(&daily.key).map_err(|e| {
                TaskError::failed(format!("Failed to read counter {}: {}", daily.key, e))
            })?;
            match value {
                Some(count) if count > 0 => batch.push(DailyCount {
                    entity_id: daily.entity_id.clone(),
                    day: daily.day,
                    count,
                }),
                _ => {}
            }
        }
        if batch.is_empty() {
            continue;
        }

        report.rows_written += store.record_daily_counts(&batch)?;
        report.rows_flushed += batch.len();
        report.batches += 1;
    }

    metrics::record_rows_flushed(report.rows_written);
    info!(
        "Flushed {} download counters ({} rows written, {} keys scanned)",
        report.rows_flushed, report.rows_written, report.keys_scanned
    );
    Ok(report)
}
