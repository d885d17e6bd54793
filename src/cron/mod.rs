//! Cron expressions and the recurring-job scheduler.

mod describe;
mod expression;
mod scheduler;

pub use describe::{describe, next_run, previous_run, schedule_info, ScheduleInfo};
pub use expression::{CronError, CronExpression};
pub use scheduler::{CronJobDefinition, CronScheduler};
