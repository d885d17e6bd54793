use cms_worker::jobs::{CleanupDownloadCounters, FlushDownloadCounts, PurgeExpiredJobs};
use cms_worker::tasks::{FnTask, TaskError, TaskRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Built-in handlers plus a few test tasks:
/// - `echo` returns its kwargs
/// - `boom` always fails with "boom"
/// - `sleepy` runs until cancelled
/// - `slow` sleeps `ms` milliseconds, ignoring cancellation
pub fn test_registry() -> TaskRegistry {
    TaskRegistry::new()
        .with(Arc::new(FlushDownloadCounts))
        .with(Arc::new(CleanupDownloadCounters))
        .with(Arc::new(PurgeExpiredJobs))
        .with(Arc::new(FnTask::new(
            "echo",
            "Return the kwargs.",
            |_, kwargs| Ok(kwargs.clone()),
        )))
        .with(Arc::new(FnTask::new("boom", "Always fails.", |_, _| {
            Err(TaskError::failed("boom"))
        })))
        .with(Arc::new(FnTask::new(
            "sleepy",
            "Run until cancelled.",
            |ctx, _| loop {
                ctx.check_cancelled()?;
                std::thread::sleep(Duration::from_millis(5));
            },
        )))
        .with(Arc::new(FnTask::new(
            "slow",
            "Sleep without checking for cancellation.",
            |_, kwargs| {
                let ms = kwargs.get("ms").and_then(|v| v.as_u64()).unwrap_or(100);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!({ "slept_ms": ms }))
            },
        )))
}
