use super::handler::TaskError;
use crate::worker::WorkerResources;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Context handed to a task handler for one job execution.
///
/// Carries the shared resources built at worker startup and a cancellation
/// token that fires on abort, timeout or shutdown.
#[derive(Clone)]
pub struct TaskContext {
    pub job_key: String,
    pub function: String,
    pub attempts: u32,

    /// Token to check for cancellation requests.
    pub cancellation_token: CancellationToken,

    /// Shared resource handles (key-value service, queue, durable store).
    pub resources: Arc<WorkerResources>,
}

impl TaskContext {
    pub fn new(
        job_key: impl Into<String>,
        function: impl Into<String>,
        attempts: u32,
        cancellation_token: CancellationToken,
        resources: Arc<WorkerResources>,
    ) -> Self {
        Self {
            job_key: job_key.into(),
            function: function.into(),
            attempts,
            cancellation_token,
            resources,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// `Err(TaskError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report progress (clamped to 100). Failures are logged and ignored.
    pub fn set_progress(&self, percent: u8) {
        if let Err(e) = self.resources.queue.set_progress(&self.job_key, percent) {
            warn!("Failed to record progress for job {}: {}", self.job_key, e);
        }
    }
}
