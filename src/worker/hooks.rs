use crate::queue::Job;
use crate::stats::StatsRecorder;
use tracing::{debug, info};

/// Runs right before a dequeued job executes. Logging only.
pub fn before_process(job: &Job) {
    info!(
        "Processing job {} ({}), attempt {}",
        job.key, job.function, job.attempts
    );
    debug!("Job {} kwargs: {}", job.key, job.kwargs);
}

/// Runs after a job reached a final state. Counts it as failed when an error
/// was recorded, complete otherwise. Never fails.
pub fn after_process(job: &Job, stats: &StatsRecorder) {
    if job.error.is_some() {
        stats.increment_failed(&job.function);
    } else {
        stats.increment_complete(&job.function);
    }
}
