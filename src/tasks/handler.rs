use super::context::TaskContext;
use serde_json::Value as JsonValue;

/// Separator written between an error message and its trace when a failure
/// is stored on a job. Readers split combined error text on it.
pub const TRACE_MARKERS: [&str; 2] = ["\n\nCaused by:", "\n\nStack backtrace:"];

/// Errors a task handler can return.
#[derive(Debug)]
pub enum TaskError {
    InvalidArguments(String),
    ExecutionFailed {
        message: String,
        trace: Option<String>,
    },
    Cancelled,
    /// The job ran past its timeout, in whole seconds.
    Timeout(u64),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::ExecutionFailed {
            message: message.into(),
            trace: None,
        }
    }

    /// Text stored in `Job::error`: the message, followed by the trace when
    /// one exists.
    pub fn job_error_text(&self) -> String {
        match self {
            TaskError::ExecutionFailed {
                message,
                trace: Some(trace),
            } => {
                if TRACE_MARKERS
                    .iter()
                    .any(|marker| trace.starts_with(marker.trim_start_matches('\n')))
                {
                    format!("{message}\n\n{trace}")
                } else {
                    format!("{message}\n\nStack backtrace:\n{trace}")
                }
            }
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            TaskError::ExecutionFailed { message, .. } => write!(f, "{}", message),
            TaskError::Cancelled => write!(f, "Job was cancelled"),
            TaskError::Timeout(secs) => write!(f, "Job timed out after {}s", secs),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        let message = e.to_string();
        let full = format!("{:?}", e);
        let trace = full
            .strip_prefix(message.as_str())
            .map(|rest| rest.trim_start_matches('\n').to_string())
            .filter(|rest| !rest.is_empty());
        TaskError::ExecutionFailed { message, trace }
    }
}

/// A unit of work the worker can execute by name.
///
/// Handlers run on a blocking thread via `spawn_blocking`. Long-running work
/// should poll `ctx.is_cancelled()` and return `TaskError::Cancelled`.
pub trait TaskHandler: Send + Sync {
    /// Registered function name producers enqueue by.
    fn name(&self) -> &'static str;

    /// Human-readable documentation. The first line is shown in listings.
    fn description(&self) -> &'static str {
        ""
    }

    /// Run the task with the job's keyword arguments, returning its result.
    fn execute(&self, ctx: &TaskContext, kwargs: &JsonValue) -> Result<JsonValue, TaskError>;
}

type TaskFn = dyn Fn(&TaskContext, &JsonValue) -> Result<JsonValue, TaskError> + Send + Sync;

/// Adapts a closure into a [`TaskHandler`].
pub struct FnTask {
    name: &'static str,
    description: &'static str,
    func: Box<TaskFn>,
}

impl FnTask {
    pub fn new<F>(name: &'static str, description: &'static str, func: F) -> Self
    where
        F: Fn(&TaskContext, &JsonValue) -> Result<JsonValue, TaskError> + Send + Sync + 'static,
    {
        Self {
            name,
            description,
            func: Box::new(func),
        }
    }
}

impl TaskHandler for FnTask {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn execute(&self, ctx: &TaskContext, kwargs: &JsonValue) -> Result<JsonValue, TaskError> {
        (self.func)(ctx, kwargs)
    }
}
