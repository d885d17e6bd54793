//! Built-in task handlers and their recurring schedules.

pub mod cleanup_download_counters;
pub mod flush_download_counts;
pub mod purge_expired_jobs;

pub use cleanup_download_counters::{evict_stale, retention_cutoff, CleanupDownloadCounters};
pub use flush_download_counts::{flush, FlushDownloadCounts, FlushReport};
pub use purge_expired_jobs::PurgeExpiredJobs;

use crate::config::CounterSettings;
use crate::cron::{CronError, CronJobDefinition};
use crate::tasks::TaskRegistry;
use std::sync::Arc;

/// Registry holding every built-in handler.
pub fn default_registry() -> TaskRegistry {
    TaskRegistry::new()
        .with(Arc::new(FlushDownloadCounts))
        .with(Arc::new(CleanupDownloadCounters))
        .with(Arc::new(PurgeExpiredJobs))
}

/// Cron definitions of the built-in maintenance jobs.
pub fn default_cron_definitions(
    settings: &CounterSettings,
) -> Result<Vec<CronJobDefinition>, CronError> {
    Ok(vec![
        CronJobDefinition::new(
            "flush-downloads",
            flush_download_counts::FUNCTION_NAME,
            &settings.flush_cron,
        )?
        .run_at_startup(),
        CronJobDefinition::new(
            "cleanup-downloads",
            cleanup_download_counters::FUNCTION_NAME,
            &settings.cleanup_cron,
        )?,
        CronJobDefinition::new(
            "purge-expired-jobs",
            purge_expired_jobs::FUNCTION_NAME,
            &settings.purge_cron,
        )?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_cron_function_is_registered() {
        let registry = default_registry();
        let definitions = default_cron_definitions(&CounterSettings::default()).unwrap();
        assert_eq!(definitions.len(), 3);
        for def in &definitions {
            assert!(registry.contains(&def.function), "{}", def.function);
        }
    }

    #[test]
    fn test_bad_expression_is_reported() {
        let settings = CounterSettings {
            flush_cron: "61 * * * *".to_string(),
            ..Default::default()
        };
        assert!(default_cron_definitions(&settings).is_err());
    }
}
