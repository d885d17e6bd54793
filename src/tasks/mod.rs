//! Task handler API: the registration table the queue validates against and
//! the context handlers receive.

mod context;
mod handler;
mod registry;

pub use context::TaskContext;
pub use handler::{FnTask, TaskError, TaskHandler, TRACE_MARKERS};
pub use registry::TaskRegistry;
