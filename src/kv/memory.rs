use super::{KeyValueStore, KvError, KvResult};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process key-value backend.
///
/// All state sits behind one mutex so every method is atomic with respect to
/// the others. Expired keys are dropped lazily when touched.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> KvResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| KvError::Unavailable("memory store lock poisoned".to_string()))
    }
}

/// Drop `key` if it has expired, then return its live entry.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

fn glob_to_regex(pattern: &str) -> KvResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| KvError::Unavailable(format!("bad pattern {pattern}: {e}")))
}

impl KeyValueStore for MemoryKvStore {
    fn ping(&self) -> KvResult<()> {
        self.state().map(|_| ())
    }

    fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut entries = self.state()?;
        match live(&mut entries, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut entries = self.state()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        let mut entries = self.state()?;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: deadline(ttl),
            },
        );
        Ok(true)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvResult<bool> {
        let mut entries = self.state()?;
        match live(&mut entries, key) {
            Some(entry) => match &entry.value {
                Value::Str(current) if current == expected => {
                    entry.value = Value::Str(value.to_string());
                    entry.expires_at = deadline(ttl);
                    Ok(true)
                }
                Value::Str(_) => Ok(false),
                Value::ZSet(_) => Err(KvError::WrongType(key.to_string())),
            },
            None => Ok(false),
        }
    }

    fn delete(&self, key: &str) -> KvResult<bool> {
        let mut entries = self.state()?;
        let existed = live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        let mut entries = self.state()?;
        match live(&mut entries, key) {
            Some(entry) => match &entry.value {
                Value::Str(current) => {
                    let n: i64 = current
                        .parse()
                        .map_err(|_| KvError::NotAnInteger(key.to_string()))?;
                    let next = n
                        .checked_add(delta)
                        .ok_or_else(|| KvError::Overflow(key.to_string()))?;
                    entry.value = Value::Str(next.to_string());
                    Ok(next)
                }
                Value::ZSet(_) => Err(KvError::WrongType(key.to_string())),
            },
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(delta.to_string()),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut entries = self.state()?;
        match live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = deadline(Some(ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn scan(&self, pattern: &str) -> KvResult<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let mut entries = self.state()?;
        let now = Instant::now();
        entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        let mut entries = self.state()?;
        match live(&mut entries, key) {
            Some(Entry {
                value: Value::ZSet(members),
                ..
            }) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => {
                let mut members = HashMap::new();
                members.insert(member.to_string(), score);
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::ZSet(members),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut entries = self.state()?;
        let (removed, now_empty) = match live(&mut entries, key) {
            Some(Entry {
                value: Value::ZSet(members),
                ..
            }) => {
                let removed = members.remove(member).is_some();
                (removed, members.is_empty())
            }
            Some(_) => return Err(KvError::WrongType(key.to_string())),
            None => return Ok(false),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }

    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> KvResult<Vec<(String, f64)>> {
        let mut entries = self.state()?;
        match live(&mut entries, key) {
            Some(Entry {
                value: Value::ZSet(members),
                ..
            }) => {
                let mut hits: Vec<(String, f64)> = members
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect();
                hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                hits.truncate(limit);
                Ok(hits)
            }
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    fn zcard(&self, key: &str) -> KvResult<usize> {
        let mut entries = self.state()?;
        match live(&mut entries, key) {
            Some(Entry {
                value: Value::ZSet(members),
                ..
            }) => Ok(members.len()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }
}
