//! Durable job queue on the shared key-value service.
//!
//! Layout under `{prefix}:queue:{name}`:
//! - `jobs:{key}`: JSON job record, expiring `keep_result` after it finishes
//! - `pending`: sorted set of dequeue candidates scored by due time (ms)
//! - `active`: sorted set of running jobs scored by start time (ms)
//! - `index`: sorted set of every job scored by enqueue sequence
//! - `sequence`: counter feeding the index scores
//! - `in_progress:{key}`: claim lock holding the worker id, refreshed by heartbeats
//! - `abort:{key}`: cooperative abort flag
//!
//! Every state change is a compare-and-set on the record, and a job is claimed
//! through `set_nx` on its lock, so two workers never run the same job.

mod job;
mod job_queue;

pub use job::{EnqueueOptions, Job, JobStatus, JobStatusView};
pub use job_queue::{JobIter, JobQueue, QueueCounts, QueueSettings};

use crate::kv::KvError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("cannot {operation} job {key} while it is {from}")]
    InvalidTransition {
        key: String,
        from: JobStatus,
        operation: &'static str,
    },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job already exists: {0}")]
    DuplicateJob(String),

    #[error("timeout must be at least 1s, got {0:?}")]
    InvalidTimeout(Duration),

    #[error("job {0} kept changing concurrently")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] KvError),

    #[error("corrupt job record: {0}")]
    Serialization(#[from] serde_json::Error),
}
