/*!
Persistence counters and timers.

Every backend and snapshot manager owns one [`PersistenceMetrics`]. Counters
only grow until [`PersistenceMetrics::reset`] is called; readers take a
consistent [`PersistenceStats`] copy with [`PersistenceMetrics::snapshot`].
*/

use crate::integrity::timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Operations tracked by the metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Save,
    Load,
    Get,
    Set,
    Delete,
    Clear,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Save => "save",
            Operation::Load => "load",
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
            Operation::Clear => "clear",
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub save_count: u64,
    pub load_count: u64,
    pub total_save_time_ms: f64,
    pub total_load_time_ms: f64,
    pub avg_save_time_ms: f64,
    pub avg_load_time_ms: f64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub error_count: u64,
    pub errors_by_operation: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub operation_counts: BTreeMap<String, u64>,
    pub last_operation_at: Option<f64>,
}

#[derive(Debug, Default)]
struct Counters {
    save_count: u64,
    load_count: u64,
    save_time: Duration,
    load_time: Duration,
    bytes_written: u64,
    bytes_read: u64,
    error_count: u64,
    errors_by_operation: BTreeMap<Operation, u64>,
    cache_hits: u64,
    cache_misses: u64,
    operation_counts: BTreeMap<Operation, u64>,
    last_operation_at: Option<f64>,
}

/// Thread-safe counters for one persistence component
#[derive(Debug, Default)]
pub struct PersistenceMetrics {
    counters: Mutex<Counters>,
}

impl PersistenceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing an operation
    pub fn start(&self, operation: Operation) -> OperationTimer<'_> {
        OperationTimer {
            metrics: self,
            operation,
            start: Instant::now(),
        }
    }

    /// Record a completed save of `bytes` bytes
    pub fn record_save(&self, elapsed: Duration, bytes: u64) {
        let mut c = self.counters.lock();
        c.save_count += 1;
        c.save_time += elapsed;
        c.bytes_written += bytes;
        *c.operation_counts.entry(Operation::Save).or_insert(0) += 1;
        c.last_operation_at = Some(timestamp());
    }

    /// Record a completed load of `bytes` bytes
    pub fn record_load(&self, elapsed: Duration, bytes: u64) {
        let mut c = self.counters.lock();
        c.load_count += 1;
        c.load_time += elapsed;
        c.bytes_read += bytes;
        *c.operation_counts.entry(Operation::Load).or_insert(0) += 1;
        c.last_operation_at = Some(timestamp());
    }

    /// Record a completed operation that is neither a save nor a load
    pub fn record_operation(&self, operation: Operation) {
        let mut c = self.counters.lock();
        *c.operation_counts.entry(operation).or_insert(0) += 1;
        c.last_operation_at = Some(timestamp());
    }

    pub fn record_error(&self, operation: Operation) {
        let mut c = self.counters.lock();
        c.error_count += 1;
        *c.errors_by_operation.entry(operation).or_insert(0) += 1;
        c.last_operation_at = Some(timestamp());
    }

    pub fn record_cache_hit(&self) {
        self.counters.lock().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.counters.lock().cache_misses += 1;
    }

    /// Zero every counter
    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }

    /// Consistent copy of all counters
    pub fn snapshot(&self) -> PersistenceStats {
        let c = self.counters.lock();
        let total_save_time_ms = c.save_time.as_secs_f64() * 1000.0;
        let total_load_time_ms = c.load_time.as_secs_f64() * 1000.0;
        let lookups = c.cache_hits + c.cache_misses;

        PersistenceStats {
            save_count: c.save_count,
            load_count: c.load_count,
            total_save_time_ms,
            total_load_time_ms,
            avg_save_time_ms: average(total_save_time_ms, c.save_count),
            avg_load_time_ms: average(total_load_time_ms, c.load_count),
            bytes_written: c.bytes_written,
            bytes_read: c.bytes_read,
            error_count: c.error_count,
            errors_by_operation: c
                .errors_by_operation
                .iter()
                .map(|(op, n)| (op.as_str().to_string(), *n))
                .collect(),
            cache_hits: c.cache_hits,
            cache_misses: c.cache_misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                c.cache_hits as f64 / lookups as f64
            },
            operation_counts: c
                .operation_counts
                .iter()
                .map(|(op, n)| (op.as_str().to_string(), *n))
                .collect(),
            last_operation_at: c.last_operation_at,
        }
    }
}

fn average(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Times one operation; consumed by one of the `finish` methods
#[must_use = "an unfinished timer records nothing"]
pub struct OperationTimer<'a> {
    metrics: &'a PersistenceMetrics,
    operation: Operation,
    start: Instant,
}

impl OperationTimer<'_> {
    /// Complete the timer, recording `bytes` moved by a save or load
    pub fn finish(self, bytes: u64) {
        let elapsed = self.start.elapsed();
        match self.operation {
            Operation::Save => self.metrics.record_save(elapsed, bytes),
            Operation::Load => self.metrics.record_load(elapsed, bytes),
            other => self.metrics.record_operation(other),
        }
    }

    /// Complete the timer with an error
    pub fn finish_with_error(self) {
        self.metrics.record_error(self.operation);
    }

    /// Finish according to a result, passing it through
    pub fn observe<T, E>(
        self,
        result: std::result::Result<T, E>,
        bytes: impl FnOnce(&T) -> u64,
    ) -> std::result::Result<T, E> {
        match &result {
            Ok(value) => {
                let n = bytes(value);
                self.finish(n);
            }
            Err(_) => self.finish_with_error(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_counters() {
        let metrics = PersistenceMetrics::new();
        metrics.record_save(Duration::from_millis(10), 100);
        metrics.record_save(Duration::from_millis(30), 50);
        metrics.record_load(Duration::from_millis(4), 150);

        let stats = metrics.snapshot();
        assert_eq!(stats.save_count, 2);
        assert_eq!(stats.load_count, 1);
        assert_eq!(stats.bytes_written, 150);
        assert_eq!(stats.bytes_read, 150);
        assert!((stats.avg_save_time_ms - 20.0).abs() < 1e-6);
        assert!((stats.total_load_time_ms - 4.0).abs() < 1e-6);
        assert_eq!(stats.operation_counts.get("save"), Some(&2));
        assert!(stats.last_operation_at.is_some());
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = PersistenceMetrics::new();
        assert_eq!(metrics.snapshot().cache_hit_rate, 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        let stats = metrics.snapshot();
        assert_eq!(stats.cache_hits, 3);
        assert_eq!(stats.cache_misses, 1);
        assert!((stats.cache_hit_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_timer_records_errors() {
        let metrics = PersistenceMetrics::new();
        let result: Result<u32, &str> = metrics.start(Operation::Load).observe(Err("boom"), |_| 0);
        assert!(result.is_err());

        metrics.start(Operation::Delete).finish(0);

        let stats = metrics.snapshot();
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.errors_by_operation.get("load"), Some(&1));
        assert_eq!(stats.load_count, 0);
        assert_eq!(stats.operation_counts.get("delete"), Some(&1));
    }

    #[test]
    fn test_reset() {
        let metrics = PersistenceMetrics::new();
        metrics.record_save(Duration::from_millis(1), 1);
        metrics.record_error(Operation::Save);
        metrics.reset();
        assert_eq!(metrics.snapshot(), PersistenceStats::default());
    }
}
