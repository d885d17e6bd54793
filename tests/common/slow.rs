use cms_worker::kv::{KeyValueStore, KvResult, MemoryKvStore};
use std::time::Duration;

/// In-memory backend whose sorted-set range reads take `delay`, like a
/// remote service under load.
pub struct SlowKvStore {
    inner: MemoryKvStore,
    delay: Duration,
}

impl SlowKvStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryKvStore::new(),
            delay,
        }
    }
}

impl KeyValueStore for SlowKvStore {
    fn ping(&self) -> KvResult<()> {
        self.inner.ping()
    }

    fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.inner.set(key, value, ttl)
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        self.inner.set_nx(key, value, ttl)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvResult<bool> {
        self.inner.compare_and_set(key, expected, value, ttl)
    }

    fn delete(&self, key: &str) -> KvResult<bool> {
        self.inner.delete(key)
    }

    fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.inner.incr_by(key, delta)
    }

    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.inner.expire(key, ttl)
    }

    fn scan(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.inner.scan(pattern)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        self.inner.zadd(key, member, score)
    }

    fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        self.inner.zrem(key, member)
    }

    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> KvResult<Vec<(String, f64)>> {
        std::thread::sleep(self.delay);
        self.inner.zrange_by_score(key, min, max, limit)
    }

    fn zcard(&self, key: &str) -> KvResult<usize> {
        self.inner.zcard(key)
    }
}
