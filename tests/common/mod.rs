//! Common test infrastructure
//!
//! Builds an in-memory worker stack: a `MemoryKvStore`, a SQLite download
//! stats database in a temp dir, and a worker configuration with short
//! intervals so lifecycle tests finish quickly.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{test_registry, TestStack};
//!
//! #[tokio::test]
//! async fn test_echo() {
//!     let stack = TestStack::new(test_registry());
//!     let worker = stack.spawn_worker();
//!     let key = stack.resources.queue.enqueue("echo", serde_json::json!({}), None).unwrap();
//!     stack.wait_finished(&key).await;
//!     worker.stop().await;
//! }
//! ```

mod slow;
mod stack;
mod tasks;
mod unreachable;

#[allow(unused_imports)]
pub use slow::SlowKvStore;
#[allow(unused_imports)]
pub use stack::{wait_until, RunningWorker, TestStack};
#[allow(unused_imports)]
pub use tasks::test_registry;
#[allow(unused_imports)]
pub use unreachable::UnreachableKvStore;
