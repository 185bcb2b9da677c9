//! Per-operation queue statistics and the exported metrics surface.
//!
//! Every public queue operation runs under an [`OpTimer`] keyed by
//! `<dir>_<op>`; wait variants append `_wait<millis>` or `_wait_forever`.
//! Each key accumulates success/error counts and a bounded ring of failure
//! details, queryable as a [`StatsSnapshot`] for host introspection.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `convoy_queue_op_duration_seconds` | Histogram | `op` | Operation latency |
//! | `convoy_queue_ops_total` | Counter | `op`, `result` | Operation outcomes |
//! | `convoy_queue_length` | Gauge | `dir` | Children seen by the last remote fetch |
//! | `convoy_queue_watchers` | Gauge | `dir` | Armed child-list watches |
//!
//! Metrics are exposed via the `metrics` crate facade; install any exporter
//! in the host process to collect them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

use crate::error::Error;

/// Metric names as constants for consistency.
pub mod names {
    /// Histogram: operation latency in seconds.
    pub const OP_DURATION_SECONDS: &str = "convoy_queue_op_duration_seconds";
    /// Counter: operation outcomes.
    pub const OPS_TOTAL: &str = "convoy_queue_ops_total";
    /// Gauge: children seen by the last remote child-list fetch.
    pub const QUEUE_LENGTH: &str = "convoy_queue_length";
    /// Gauge: armed child-list watches.
    pub const WATCHERS: &str = "convoy_queue_watchers";
}

/// Label keys used across metrics.
pub mod labels {
    /// Operation key (`<dir>_<op>` plus any wait suffix).
    pub const OP: &str = "op";
    /// Outcome (`success` or `error`).
    pub const RESULT: &str = "result";
    /// Queue directory.
    pub const DIR: &str = "dir";
}

/// Failure details retained per operation key.
const FAILURE_DETAIL_LIMIT: usize = 10;

/// Builds the timer key for a plain operation.
#[must_use]
pub fn op_key(dir: &str, op: &str) -> String {
    format!("{dir}_{op}")
}

/// Builds the timer key for a wait variant. `Duration::MAX` means the caller
/// waits forever.
#[must_use]
pub fn wait_op_key(dir: &str, op: &str, wait: Duration) -> String {
    if wait == Duration::MAX {
        format!("{dir}_{op}_wait_forever")
    } else {
        format!("{dir}_{op}_wait{}", wait.as_millis())
    }
}

/// One failed operation, retained for the stats snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    /// The operation key that failed.
    pub request: String,
    /// The error it failed with.
    pub response: String,
}

#[derive(Debug, Default)]
struct OpStat {
    success: u64,
    errors: u64,
    failure_details: VecDeque<FailureDetail>,
}

/// Counters for a single operation key, as captured by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSnapshot {
    /// Successful completions.
    pub success: u64,
    /// Failed completions.
    pub errors: u64,
    /// The most recent failures, oldest first.
    pub failure_details: Vec<FailureDetail>,
}

/// A point-in-time copy of the statistics registry.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Children seen by the last remote child-list fetch.
    pub queue_length: usize,
    /// Armed child-list watches.
    pub watcher_count: i64,
    /// Per-operation counters keyed by `<dir>_<op>`.
    pub ops: BTreeMap<String, OpSnapshot>,
}

/// Statistics registry shared by the queues over one directory.
///
/// Cheap to share behind an `Arc`; hosts typically keep one per queue
/// directory and fold [`snapshot`](Self::snapshot) into their admin surface.
#[derive(Debug, Default)]
pub struct QueueStats {
    queue_length: AtomicUsize,
    watcher_count: AtomicI64,
    ops: Mutex<HashMap<String, OpStat>>,
}

impl QueueStats {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a timer for `key`. Call [`OpTimer::finish`] with the
    /// operation's result; the latency is recorded even if the timer is
    /// dropped without finishing.
    #[must_use]
    pub fn time(&self, key: impl Into<String>) -> OpTimer<'_> {
        OpTimer {
            stats: self,
            key: key.into(),
            start: Instant::now(),
        }
    }

    /// Records the child count seen by a remote child-list fetch.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_length(&self, dir: &str, len: usize) {
        self.queue_length.store(len, Ordering::Relaxed);
        gauge!(names::QUEUE_LENGTH, labels::DIR => dir.to_string()).set(len as f64);
    }

    /// Records the number of armed child-list watches.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_watcher_count(&self, dir: &str, count: i64) {
        self.watcher_count.store(count, Ordering::Relaxed);
        gauge!(names::WATCHERS, labels::DIR => dir.to_string()).set(count as f64);
    }

    /// Returns the child count recorded by the last remote fetch.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.queue_length.load(Ordering::Relaxed)
    }

    /// Captures a copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let ops = self.ops_locked();
        StatsSnapshot {
            queue_length: self.queue_length.load(Ordering::Relaxed),
            watcher_count: self.watcher_count.load(Ordering::Relaxed),
            ops: ops
                .iter()
                .map(|(key, stat)| {
                    (
                        key.clone(),
                        OpSnapshot {
                            success: stat.success,
                            errors: stat.errors,
                            failure_details: stat.failure_details.iter().cloned().collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn record_success(&self, key: &str) {
        counter!(
            names::OPS_TOTAL,
            labels::OP => key.to_string(),
            labels::RESULT => "success".to_string(),
        )
        .increment(1);
        self.ops_locked().entry(key.to_string()).or_default().success += 1;
    }

    fn record_error(&self, key: &str, error: &Error) {
        counter!(
            names::OPS_TOTAL,
            labels::OP => key.to_string(),
            labels::RESULT => "error".to_string(),
        )
        .increment(1);
        let mut ops = self.ops_locked();
        let stat = ops.entry(key.to_string()).or_default();
        stat.errors += 1;
        if stat.failure_details.len() >= FAILURE_DETAIL_LIMIT {
            stat.failure_details.pop_front();
        }
        stat.failure_details.push_back(FailureDetail {
            request: key.to_string(),
            response: error.to_string(),
        });
    }

    fn ops_locked(&self) -> MutexGuard<'_, HashMap<String, OpStat>> {
        // A poisoned registry only ever holds counters; keep serving them.
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Timer guard for one operation invocation.
///
/// Records the latency histogram when dropped; [`finish`](Self::finish)
/// additionally records the outcome counters.
#[derive(Debug)]
pub struct OpTimer<'a> {
    stats: &'a QueueStats,
    key: String,
    start: Instant,
}

impl OpTimer<'_> {
    /// Records the outcome of the timed operation and stops the timer.
    pub fn finish<T>(self, result: &Result<T, Error>) {
        match result {
            Ok(_) => self.stats.record_success(&self.key),
            Err(error) => self.stats.record_error(&self.key, error),
        }
    }

    /// Returns the elapsed time since the timer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for OpTimer<'_> {
    fn drop(&mut self) {
        histogram!(
            names::OP_DURATION_SECONDS,
            labels::OP => self.key.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
