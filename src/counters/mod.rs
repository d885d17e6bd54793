//! Namespaced atomic counters on the shared key-value service.
//!
//! The write path is called from request handlers and must never fail the
//! caller: errors are logged, counted and swallowed. The read path returns
//! empty or zero values when the backend cannot be reached.

use crate::kv::{KeyBuilder, KeyValueStore, KvResult};
use crate::metrics;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Namespace of the per-entity, per-day download counters.
pub const DAILY_DOWNLOADS_NAMESPACE: &str = "downloads:daily";

/// Format of the day component in daily counter keys.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// A parsed `{namespace}:{entity_id}:{YYYY-MM-DD}` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCounterKey {
    pub key: String,
    pub entity_id: String,
    pub day: NaiveDate,
}

#[derive(Clone)]
pub struct CounterStore {
    kv: Arc<dyn KeyValueStore>,
    keys: KeyBuilder,
}

impl CounterStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, keys: KeyBuilder) -> Self {
        Self { kv, keys }
    }

    pub fn key_for(&self, namespace: &str, parts: &[&str]) -> String {
        self.keys.key(namespace, parts)
    }

    /// Add one to `{prefix}:{namespace}:{parts}`. Returns the new value, or
    /// `None` when the increment was dropped.
    pub fn increment(&self, namespace: &str, parts: &[&str]) -> Option<i64> {
        self.increment_by(namespace, parts, 1)
    }

    pub fn increment_by(&self, namespace: &str, parts: &[&str], delta: i64) -> Option<i64> {
        let key = self.keys.key(namespace, parts);
        match self.kv.incr_by(&key, delta) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to increment counter {}: {}", key, e);
                metrics::record_counter_failure(namespace);
                None
            }
        }
    }

    /// Increment the counter of `entity_id` for `day`.
    ///
    /// The first increment of a key also sets an expiry of `ttl` so orphaned
    /// keys disappear even if cleanup never runs.
    pub fn increment_daily(
        &self,
        namespace: &str,
        entity_id: &str,
        day: NaiveDate,
        ttl: Duration,
    ) -> Option<i64> {
        let day = day.format(DAY_FORMAT).to_string();
        let value = self.increment(namespace, &[entity_id, &day])?;
        if value == 1 {
            let key = self.keys.key(namespace, &[entity_id, &day]);
            if let Err(e) = self.kv.expire(&key, ttl) {
                warn!("Failed to set expiry on {}: {}", key, e);
            }
        }
        Some(value)
    }

    /// Current value, 0 when absent or unreadable.
    pub fn get(&self, namespace: &str, parts: &[&str]) -> i64 {
        let key = self.keys.key(namespace, parts);
        match self.kv.get(&key) {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| {
                warn!("Counter {} holds a non-integer value", key);
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!("Failed to read counter {}: {}", key, e);
                0
            }
        }
    }

    /// Counters of `namespace` matching `pattern`, keyed relative to the namespace.
    pub fn get_all(&self, namespace: &str, pattern: &str) -> Vec<(String, i64)> {
        match self.read_all(namespace, pattern) {
            Ok(values) => values,
            Err(e) => {
                warn!("Failed to read counters {}:{}: {}", namespace, pattern, e);
                Vec::new()
            }
        }
    }

    /// The `limit` largest counters, descending. Equal counts keep scan order.
    pub fn get_top_n(&self, namespace: &str, pattern: &str, limit: usize) -> Vec<(String, i64)> {
        let mut values = self.get_all(namespace, pattern);
        values.sort_by(|a, b| b.1.cmp(&a.1));
        values.truncate(limit);
        values
    }

    fn read_all(&self, namespace: &str, pattern: &str) -> KvResult<Vec<(String, i64)>> {
        let keys = self.kv.scan(&self.keys.pattern(namespace, pattern))?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            // keys may expire between scan and read
            let Some(raw) = self.kv.get(&key)? else {
                continue;
            };
            let Ok(count) = raw.parse::<i64>() else {
                debug!("Skipping non-integer counter {}", key);
                continue;
            };
            let name = self
                .keys
                .strip(namespace, &key)
                .unwrap_or(key.as_str())
                .to_string();
            values.push((name, count));
        }
        Ok(values)
    }

    /// All daily counter keys of `namespace`, with their parsed components.
    /// Keys whose day does not parse are skipped.
    pub fn daily_keys(&self, namespace: &str) -> KvResult<Vec<DailyCounterKey>> {
        let keys = self.kv.scan(&self.keys.pattern(namespace, "*"))?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                let parsed = self.parse_daily_key(namespace, &key);
                if parsed.is_none() {
                    debug!("Ignoring malformed daily counter key {}", key);
                }
                parsed
            })
            .collect())
    }

    fn parse_daily_key(&self, namespace: &str, key: &str) -> Option<DailyCounterKey> {
        let rest = self.keys.strip(namespace, key)?;
        let (entity_id, day) = rest.rsplit_once(':')?;
        if entity_id.is_empty() {
            return None;
        }
        let day = NaiveDate::parse_from_str(day, DAY_FORMAT).ok()?;
        Some(DailyCounterKey {
            key: key.to_string(),
            entity_id: entity_id.to_string(),
            day,
        })
    }

    /// Raw read of one key, for the flush job.
    pub fn read_raw(&self, key: &str) -> KvResult<Option<i64>> {
        Ok(self.kv.get(key)?.and_then(|raw| raw.parse().ok()))
    }

    pub fn delete_key(&self, key: &str) -> KvResult<bool> {
        self.kv.delete(key)
    }
}
