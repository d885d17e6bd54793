//! Key-value service abstraction.
//!
//! Every other subsystem (job queue, counters, stats) talks to the shared
//! key-value service through [`KeyValueStore`]. Implementations must make each
//! method atomic on its own: `incr_by`, `set_nx` and `compare_and_set` are the
//! primitives the queue and the counter pipeline rely on for consistency.

mod keys;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use keys::KeyBuilder;
pub use memory::MemoryKvStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisKvStore;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Errors surfaced by a key-value backend.
#[derive(Debug, Error)]
pub enum KvError {
    /// Backend could not be reached or the command failed in transit.
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of another type (e.g. INCR on a sorted set).
    #[error("wrong value type stored at {0}")]
    WrongType(String),

    /// The stored value cannot be interpreted as an integer.
    #[error("value stored at {0} is not an integer")]
    NotAnInteger(String),

    /// An increment would leave the signed 64-bit range.
    #[error("increment would overflow the value at {0}")]
    Overflow(String),

    #[error("unsupported key-value url: {0}")]
    UnsupportedUrl(String),
}

/// Atomic primitives offered by the shared key-value service.
///
/// The trait is synchronous, like the SQLite-backed stores: calls are short
/// round trips and handlers run on blocking threads anyway.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait KeyValueStore: Send + Sync {
    fn ping(&self) -> KvResult<()>;

    fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Unconditional write. `ttl = None` stores the value without expiry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Write only when the key is absent. Returns true when the write happened.
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool>;

    /// Replace the value only if it currently equals `expected`.
    /// Returns false when the key is missing or holds something else.
    fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvResult<bool>;

    fn delete(&self, key: &str) -> KvResult<bool>;

    /// Atomically add `delta`, creating the key at 0 first when absent.
    fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64>;

    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Keys matching a glob pattern (`*` and `?` wildcards), without duplicates.
    fn scan(&self, pattern: &str) -> KvResult<Vec<String>>;

    fn zadd(&self, key: &str, member: &str, score: f64) -> KvResult<()>;

    fn zrem(&self, key: &str, member: &str) -> KvResult<bool>;

    /// Members with `min <= score <= max`, ascending by score, at most `limit`.
    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> KvResult<Vec<(String, f64)>>;

    fn zcard(&self, key: &str) -> KvResult<usize>;

    /// Release connections. Safe to call more than once.
    fn close(&self) {}
}

/// Open the backend named by `url`: `memory://` or `redis://host:port/db`.
pub fn open_store(url: &str) -> KvResult<Arc<dyn KeyValueStore>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryKvStore::new()));
    }
    #[cfg(feature = "redis")]
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Arc::new(RedisKvStore::open(url)?));
    }
    Err(KvError::UnsupportedUrl(url.to_string()))
}
