use crate::tasks::{TaskContext, TaskError, TaskHandler};
use serde_json::{json, Value as JsonValue};
use tracing::info;

pub const FUNCTION_NAME: &str = "purge_expired_jobs";

/// Drops queue index entries left behind by expired job records.
pub struct PurgeExpiredJobs;

impl TaskHandler for PurgeExpiredJobs {
    fn name(&self) -> &'static str {
        FUNCTION_NAME
    }

    fn description(&self) -> &'static str {
        "Remove index entries of finished jobs whose records expired."
    }

    fn execute(&self, ctx: &TaskContext, _kwargs: &JsonValue) -> Result<JsonValue, TaskError> {
        ctx.check_cancelled()?;
        let purged = ctx
            .resources
            .queue
            .purge_expired()
            .map_err(|e| TaskError::failed(format!("Failed to purge expired jobs: {}", e)))?;
        if purged > 0 {
            info!("Purged {} expired job entries", purged);
        }
        Ok(json!({ "purged": purged }))
    }
}
