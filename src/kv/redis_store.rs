use super::{KeyValueStore, KvError, KvResult};
use r2d2::Pool;
use redis::{Client, Connection, RedisError, Script};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_COUNT: usize = 500;

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then
  return 0
end
if ARGV[3] == '' then
  redis.call('SET', KEYS[1], ARGV[2])
else
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
end
return 1
"#;

/// Connections kept per process. Heartbeats and claims must not queue
/// behind a long SCAN from a handler.
pub const DEFAULT_POOL_SIZE: u32 = 16;

/// Redis-backed key-value service shared by every worker process.
///
/// Commands check a connection out of an r2d2 pool; broken connections are
/// discarded by the pool and replaced on the next checkout.
pub struct RedisKvStore {
    pool: Pool<Client>,
    cas: Script,
}

impl RedisKvStore {
    pub fn open(url: &str) -> KvResult<Self> {
        Self::open_with_pool(url, DEFAULT_POOL_SIZE, CONNECT_TIMEOUT)
    }

    /// Connections are opened lazily, so an unreachable server only shows up
    /// on the first command.
    pub fn open_with_pool(url: &str, max_size: u32, connect_timeout: Duration) -> KvResult<Self> {
        let client = Client::open(url).map_err(unavailable)?;
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .min_idle(Some(0))
            .connection_timeout(connect_timeout)
            .build_unchecked(client);
        Ok(Self {
            pool,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, RedisError>,
    ) -> KvResult<T> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        f(&mut *conn).map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                warn!("Redis command failed on a pooled connection: {}", e);
            }
            classify(e)
        })
    }

    pub fn pool_state(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

fn unavailable(e: RedisError) -> KvError {
    KvError::Unavailable(e.to_string())
}

fn classify(e: RedisError) -> KvError {
    let message = e.to_string();
    if message.contains("WRONGTYPE") {
        KvError::WrongType(message)
    } else if message.contains("not an integer") {
        KvError::NotAnInteger(message)
    } else if message.contains("would overflow") {
        KvError::Overflow(message)
    } else {
        KvError::Unavailable(message)
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl KeyValueStore for RedisKvStore {
    fn ping(&self) -> KvResult<()> {
        self.with_conn(|c| redis::cmd("PING").query::<String>(c).map(|_| ()))
    }

    fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.with_conn(|c| redis::cmd("GET").arg(key).query(c))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        self.with_conn(|c| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            cmd.query::<()>(c)
        })
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        self.with_conn(|c| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            let reply: Option<String> = cmd.query(c)?;
            Ok(reply.is_some())
        })
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvResult<bool> {
        let ttl_arg = ttl.map(|t| ttl_millis(t).to_string()).unwrap_or_default();
        self.with_conn(|c| {
            let swapped: i64 = self
                .cas
                .key(key)
                .arg(expected)
                .arg(value)
                .arg(ttl_arg.as_str())
                .invoke(c)?;
            Ok(swapped == 1)
        })
    }

    fn delete(&self, key: &str) -> KvResult<bool> {
        self.with_conn(|c| {
            let removed: i64 = redis::cmd("DEL").arg(key).query(c)?;
            Ok(removed > 0)
        })
    }

    fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.with_conn(|c| redis::cmd("INCRBY").arg(key).arg(delta).query(c))
    }

    fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.with_conn(|c| {
            let set: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query(c)?;
            Ok(set == 1)
        })
    }

    fn scan(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.with_conn(|c| {
            // SCAN may return a key more than once
            let mut keys = BTreeSet::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query(c)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(keys.into_iter().collect())
        })
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        self.with_conn(|c| {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query::<i64>(c)
                .map(|_| ())
        })
    }

    fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        self.with_conn(|c| {
            let removed: i64 = redis::cmd("ZREM").arg(key).arg(member).query(c)?;
            Ok(removed > 0)
        })
    }

    fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> KvResult<Vec<(String, f64)>> {
        self.with_conn(|c| {
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(min))
                .arg(score_arg(max))
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(0)
                .arg(limit.min(i64::MAX as usize))
                .query(c)
        })
    }

    fn zcard(&self, key: &str) -> KvResult<usize> {
        self.with_conn(|c| redis::cmd("ZCARD").arg(key).query(c))
    }

    fn close(&self) {
        // pooled connections close when the store is dropped
        let (connections, idle) = self.pool_state();
        debug!(
            "Closing redis store with {} connections ({} idle)",
            connections, idle
        );
    }
}
