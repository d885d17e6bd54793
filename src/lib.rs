//! CMS Worker Library
//!
//! Background task execution for the CMS: job queue, worker runtime, cron
//! scheduler, download counters and their flush to durable storage, and the
//! admin monitoring façade.

pub mod admin;
pub mod config;
pub mod counters;
pub mod cron;
pub mod download_stats;
pub mod jobs;
pub mod kv;
pub mod metrics;
pub mod queue;
pub mod sqlite_persistence;
pub mod stats;
pub mod tasks;
pub mod worker;

// Re-export commonly used types for convenience
pub use admin::AdminService;
pub use config::{AppConfig, CliConfig, FileConfig};
pub use counters::CounterStore;
pub use cron::{CronExpression, CronJobDefinition, CronScheduler};
pub use kv::{KeyValueStore, MemoryKvStore};
pub use queue::{Job, JobQueue, JobStatus, QueueError};
pub use stats::StatsRecorder;
pub use tasks::{FnTask, TaskContext, TaskError, TaskHandler, TaskRegistry};
pub use worker::{Worker, WorkerResources};
