//! Durable per-function execution counters.
//!
//! Stored under `{prefix}:stats:functions:{function}:{field}`, apart from the
//! queue keys, so they outlive both job result expiry and worker restarts.

use crate::kv::{KeyBuilder, KeyValueStore, KvResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

const STATS_DOMAIN: &str = "stats:functions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatField {
    Complete,
    Failed,
    Retried,
}

impl StatField {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatField::Complete => "complete",
            StatField::Failed => "failed",
            StatField::Retried => "retried",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(StatField::Complete),
            "failed" => Some(StatField::Failed),
            "retried" => Some(StatField::Retried),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FunctionStats {
    pub complete: u64,
    pub failed: u64,
    pub retried: u64,
}

impl FunctionStats {
    /// `complete / (complete + failed)`, 0 when nothing has finished.
    pub fn success_rate(&self) -> f64 {
        let finished = self.complete + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.complete as f64 / finished as f64
        }
    }

    fn add(&mut self, other: &FunctionStats) {
        self.complete += other.complete;
        self.failed += other.failed;
        self.retried += other.retried;
    }

    fn set(&mut self, field: StatField, value: u64) {
        match field {
            StatField::Complete => self.complete = value,
            StatField::Failed => self.failed = value,
            StatField::Retried => self.retried = value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub functions: BTreeMap<String, FunctionStats>,
    pub totals: FunctionStats,
    pub success_rate: f64,
}

#[derive(Clone)]
pub struct StatsRecorder {
    kv: Arc<dyn KeyValueStore>,
    keys: KeyBuilder,
}

impl StatsRecorder {
    pub fn new(kv: Arc<dyn KeyValueStore>, keys: KeyBuilder) -> Self {
        Self { kv, keys }
    }

    pub fn increment_complete(&self, function: &str) {
        self.increment(function, StatField::Complete);
    }

    pub fn increment_failed(&self, function: &str) {
        self.increment(function, StatField::Failed);
    }

    pub fn increment_retried(&self, function: &str) {
        self.increment(function, StatField::Retried);
    }

    fn increment(&self, function: &str, field: StatField) {
        let key = self.keys.key(STATS_DOMAIN, &[function, field.as_str()]);
        if let Err(e) = self.kv.incr_by(&key, 1) {
            warn!(
                "Failed to record {} for function {}: {}",
                field.as_str(),
                function,
                e
            );
        }
    }

    /// Per-function and aggregate counts. An unreachable backend yields zeros.
    pub fn get_stats(&self) -> StatsSnapshot {
        match self.try_get_stats() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to read function stats: {}", e);
                StatsSnapshot::default()
            }
        }
    }

    pub fn try_get_stats(&self) -> KvResult<StatsSnapshot> {
        let keys = self.kv.scan(&self.keys.pattern(STATS_DOMAIN, "*"))?;
        let mut functions: BTreeMap<String, FunctionStats> = BTreeMap::new();
        for key in keys {
            let Some((function, field)) = self
                .keys
                .strip(STATS_DOMAIN, &key)
                .and_then(|rest| rest.rsplit_once(':'))
            else {
                continue;
            };
            let Some(field) = StatField::parse(field) else {
                continue;
            };
            let value = self
                .kv
                .get(&key)?
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(0);
            functions
                .entry(function.to_string())
                .or_default()
                .set(field, value);
        }

        let mut totals = FunctionStats::default();
        for stats in functions.values() {
            totals.add(stats);
        }
        Ok(StatsSnapshot {
            success_rate: totals.success_rate(),
            functions,
            totals,
        })
    }

    pub fn get_function(&self, function: &str) -> FunctionStats {
        let mut stats = FunctionStats::default();
        for field in [StatField::Complete, StatField::Failed, StatField::Retried] {
            let key = self.keys.key(STATS_DOMAIN, &[function, field.as_str()]);
            match self.kv.get(&key) {
                Ok(value) => {
                    stats.set(field, value.and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                Err(e) => {
                    warn!("Failed to read stats for {}: {}", function, e);
                    return FunctionStats::default();
                }
            }
        }
        stats
    }
}
