//! Worker runtime: shared resources, lifecycle hooks and the dequeue loop.

mod hooks;
mod resources;
mod runtime;

pub use hooks::{after_process, before_process};
pub use resources::WorkerResources;
#[cfg(test)]
pub(crate) use resources::test_support;
pub use runtime::{Worker, WorkerHealth, WORKERS_DOMAIN};
