use cms_worker::kv::{KeyValueStore, KvError, KvResult};
use std::time::Duration;

/// Backend whose every call fails as if the service were down.
pub struct UnreachableKvStore;

fn refused<T>() -> KvResult<T> {
    Err(KvError::Unavailable("connection refused".to_string()))
}

impl KeyValueStore for UnreachableKvStore {
    fn ping(&self) -> KvResult<()> {
        refused()
    }

    fn get(&self, _key: &str) -> KvResult<Option<String>> {
        refused()
    }

    fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> KvResult<()> {
        refused()
    }

    fn set_nx(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> KvResult<bool> {
        refused()
    }

    fn compare_and_set(
        &self,
        _key: &str,
        _expected: &str,
        _value: &str,
        _ttl: Option<Duration>,
    ) -> KvResult<bool> {
        refused()
    }

    fn delete(&self, _key: &str) -> KvResult<bool> {
        refused()
    }

    fn incr_by(&self, _key: &str, _delta: i64) -> KvResult<i64> {
        refused()
    }

    fn expire(&self, _key: &str, _ttl: Duration) -> KvResult<bool> {
        refused()
    }

    fn scan(&self, _pattern: &str) -> KvResult<Vec<String>> {
        refused()
    }

    fn zadd(&self, _key: &str, _member: &str, _score: f64) -> KvResult<()> {
        refused()
    }

    fn zrem(&self, _key: &str, _member: &str) -> KvResult<bool> {
        refused()
    }

    fn zrange_by_score(
        &self,
        _key: &str,
        _min: f64,
        _max: f64,
        _limit: usize,
    ) -> KvResult<Vec<(String, f64)>> {
        refused()
    }

    fn zcard(&self, _key: &str) -> KvResult<usize> {
        refused()
    }
}
