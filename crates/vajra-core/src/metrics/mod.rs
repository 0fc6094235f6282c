use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::task::TaskResult;

/// Most-recent latency samples kept per test.
pub const MAX_LATENCY_HISTORY: usize = 10_000;
/// Most-recent completion timestamps kept per test.
pub const MAX_TIMESTAMP_HISTORY: usize = 100_000;
/// Sliding window for the TPS estimate.
pub const TPS_WINDOW_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Latency distribution over the bounded history window (ms).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LatencyStats {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// A point-in-time view of a collector.
///
/// Individual fields may exhibit minor skew against each other (counters are
/// read without freezing concurrent recorders); `successful_tasks +
/// failed_tasks <= total_tasks` always holds, the difference being in-flight
/// invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsSnapshot {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub active_tasks: i64,
    pub current_tps: f64,
    /// Percentage in [0, 100], derived from the counters.
    pub error_rate: f64,
    pub latency: LatencyStats,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub error_counts: HashMap<String, u64>,
    pub timestamp_ms: u64,
}

impl MetricsSnapshot {
    /// An all-zero snapshot stamped with the current time.
    pub fn empty() -> Self {
        Self {
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            active_tasks: 0,
            current_tps: 0.0,
            error_rate: 0.0,
            latency: LatencyStats::default(),
            error_counts: HashMap::new(),
            timestamp_ms: now_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Per-test metrics state: atomic counters plus bounded FIFO histories.
///
/// `record_result` is called concurrently from every virtual user and never
/// fails; history inserts evict the oldest entry once the cap is reached so
/// memory stays bounded for arbitrarily long tests.
pub struct MetricsCollector {
    total_tasks: AtomicU64,
    successful_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    active_tasks: AtomicI64,
    /// (completion timestamp ms, latency ms), newest at the back.
    latency_history: Mutex<VecDeque<(u64, f64)>>,
    task_timestamps: Mutex<VecDeque<u64>>,
    error_counts: Mutex<HashMap<String, u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            total_tasks: AtomicU64::new(0),
            successful_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            active_tasks: AtomicI64::new(0),
            latency_history: Mutex::new(VecDeque::with_capacity(1024)),
            task_timestamps: Mutex::new(VecDeque::with_capacity(1024)),
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Record one completed invocation. Thread-safe and infallible.
    pub fn record_result(&self, result: &TaskResult) {
        let now = now_ms();
        let latency_ms = result.latency_nanos as f64 / 1_000_000.0;

        // Total is bumped before the outcome counter so that
        // successful + failed <= total holds at every observation point.
        self.total_tasks.fetch_add(1, Ordering::Relaxed);

        {
            let mut history = self
                .latency_history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if history.len() >= MAX_LATENCY_HISTORY {
                history.pop_front();
            }
            history.push_back((now, latency_ms));
        }
        {
            let mut timestamps = self
                .task_timestamps
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if timestamps.len() >= MAX_TIMESTAMP_HISTORY {
                timestamps.pop_front();
            }
            timestamps.push_back(now);
        }

        if result.success {
            self.successful_tasks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_tasks.fetch_add(1, Ordering::Relaxed);
            let kind = result
                .error_kind
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            let mut counts = self
                .error_counts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *counts.entry(kind).or_insert(0) += 1;
        }
    }

    /// Adjust the in-flight gauge; callers pair +1/-1 around execution.
    pub fn add_active(&self, delta: i64) {
        self.active_tasks.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn active_tasks(&self) -> i64 {
        self.active_tasks.load(Ordering::Relaxed)
    }

    /// Tasks per second over the trailing [`TPS_WINDOW_MS`] window.
    pub fn current_tps(&self) -> f64 {
        let cutoff = now_ms().saturating_sub(TPS_WINDOW_MS);
        let timestamps = self
            .task_timestamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let in_window = timestamps.iter().rev().take_while(|&&ts| ts >= cutoff).count();
        in_window as f64 / (TPS_WINDOW_MS as f64 / 1000.0)
    }

    /// Build a consistent-enough snapshot without blocking recorders for
    /// longer than the history copy.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_tasks.load(Ordering::Relaxed);
        let successful = self.successful_tasks.load(Ordering::Relaxed);
        let failed = self.failed_tasks.load(Ordering::Relaxed);

        let latencies: Vec<f64> = {
            let history = self
                .latency_history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            history.iter().map(|&(_, ms)| ms).collect()
        };

        let error_counts = {
            let counts = self
                .error_counts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            counts.clone()
        };

        let error_rate = if total > 0 {
            failed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            total_tasks: total,
            successful_tasks: successful,
            failed_tasks: failed,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            current_tps: self.current_tps(),
            error_rate,
            latency: latency_stats(latencies),
            error_counts,
            timestamp_ms: now_ms(),
        }
    }

    /// Drop the histories; the collector stays usable but empty.
    pub fn close(&self) {
        self.latency_history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.task_timestamps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    #[cfg(test)]
    fn latency_history_len(&self) -> usize {
        self.latency_history.lock().unwrap().len()
    }

    #[cfg(test)]
    fn oldest_latency_ms(&self) -> Option<f64> {
        self.latency_history.lock().unwrap().front().map(|&(_, ms)| ms)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn latency_stats(mut latencies: Vec<f64>) -> LatencyStats {
    if latencies.is_empty() {
        return LatencyStats::default();
    }
    latencies.sort_unstable_by(|a, b| a.partial_cmp(b).expect("latency is never NaN"));
    let sum: f64 = latencies.iter().sum();
    LatencyStats {
        p50_ms: percentile(&latencies, 50.0),
        p95_ms: percentile(&latencies, 95.0),
        p99_ms: percentile(&latencies, 99.0),
        mean_ms: sum / latencies.len() as f64,
        min_ms: latencies[0],
        max_ms: latencies[latencies.len() - 1],
    }
}

/// Linear-interpolation percentile (rank = p/100 * (n-1)) over a sorted
/// slice. Empty input yields 0.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskResult;

    fn success_ms(task_id: u64, latency_ms: u64) -> TaskResult {
        TaskResult::success(task_id, latency_ms * 1_000_000, 0)
    }

    fn failure(task_id: u64, kind: &str) -> TaskResult {
        TaskResult::failure(task_id, 1_000_000, kind.to_string())
    }

    // -----------------------------------------------------------------------
    // record_result
    // -----------------------------------------------------------------------

    #[test]
    fn record_updates_counters() {
        let collector = MetricsCollector::new();
        collector.record_result(&success_ms(1, 100));
        collector.record_result(&success_ms(2, 200));
        collector.record_result(&failure(3, "timeout"));

        let snap = collector.snapshot();
        assert_eq!(snap.total_tasks, 3);
        assert_eq!(snap.successful_tasks, 2);
        assert_eq!(snap.failed_tasks, 1);
        assert_eq!(snap.error_counts.get("timeout"), Some(&1));
    }

    #[test]
    fn failure_without_kind_counts_as_unknown() {
        let collector = MetricsCollector::new();
        let mut result = failure(1, "x");
        result.error_kind = None;
        collector.record_result(&result);
        let snap = collector.snapshot();
        assert_eq!(snap.error_counts.get("unknown"), Some(&1));
    }

    #[test]
    fn latency_history_evicts_oldest_beyond_cap() {
        let collector = MetricsCollector::new();
        for i in 0..(MAX_LATENCY_HISTORY as u64 + 1) {
            collector.record_result(&success_ms(i, i));
        }
        assert_eq!(collector.latency_history_len(), MAX_LATENCY_HISTORY);
        // The first recorded sample (0 ms) must have been evicted.
        assert_eq!(collector.oldest_latency_ms(), Some(1.0));
    }

    #[test]
    fn error_counts_accumulate_by_kind() {
        let collector = MetricsCollector::new();
        collector.record_result(&failure(1, "timeout"));
        collector.record_result(&failure(2, "timeout"));
        collector.record_result(&failure(3, "http-5xx"));
        let snap = collector.snapshot();
        assert_eq!(snap.error_counts.get("timeout"), Some(&2));
        assert_eq!(snap.error_counts.get("http-5xx"), Some(&1));
    }

    // -----------------------------------------------------------------------
    // snapshot
    // -----------------------------------------------------------------------

    #[test]
    fn empty_snapshot_is_all_zero() {
        let collector = MetricsCollector::new();
        let snap = collector.snapshot();
        assert_eq!(snap.total_tasks, 0);
        assert_eq!(snap.successful_tasks, 0);
        assert_eq!(snap.failed_tasks, 0);
        assert_eq!(snap.active_tasks, 0);
        assert_eq!(snap.current_tps, 0.0);
        assert_eq!(snap.error_rate, 0.0);
        assert_eq!(snap.latency, LatencyStats::default());
    }

    #[test]
    fn counter_invariant_holds() {
        let collector = MetricsCollector::new();
        for i in 0..100 {
            collector.record_result(&success_ms(i, 10));
        }
        let snap = collector.snapshot();
        assert!(snap.successful_tasks + snap.failed_tasks <= snap.total_tasks);
    }

    #[test]
    fn error_rate_is_percentage() {
        let collector = MetricsCollector::new();
        collector.record_result(&success_ms(1, 10));
        collector.record_result(&failure(2, "timeout"));
        let snap = collector.snapshot();
        assert!((snap.error_rate - 50.0).abs() < 1e-9);
        assert!(snap.error_rate >= 0.0 && snap.error_rate <= 100.0);
    }

    #[test]
    fn active_gauge_tracks_deltas() {
        let collector = MetricsCollector::new();
        collector.add_active(1);
        collector.add_active(1);
        collector.add_active(-1);
        assert_eq!(collector.active_tasks(), 1);
        assert_eq!(collector.snapshot().active_tasks, 1);
    }

    #[test]
    fn tps_counts_recent_completions_over_window() {
        let collector = MetricsCollector::new();
        for i in 0..50 {
            collector.record_result(&success_ms(i, 1));
        }
        // All 50 completions are inside the 5 s window.
        let tps = collector.current_tps();
        assert!((tps - 10.0).abs() < 1e-9, "expected 10 TPS, got {tps}");
    }

    #[test]
    fn close_clears_histories() {
        let collector = MetricsCollector::new();
        collector.record_result(&success_ms(1, 10));
        collector.close();
        assert_eq!(collector.latency_history_len(), 0);
        // Counters survive close; only histories are released.
        assert_eq!(collector.snapshot().total_tasks, 1);
    }

    // -----------------------------------------------------------------------
    // percentile
    // -----------------------------------------------------------------------

    #[test]
    fn percentile_empty_is_zero() {
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn percentile_single_value() {
        assert_eq!(percentile(&[42.0], 50.0), 42.0);
        assert_eq!(percentile(&[42.0], 99.0), 42.0);
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values: Vec<f64> = (1..=10).map(|v| (v * 10) as f64).collect();
        // rank(p50) = 0.5 * 9 = 4.5 => 50 + 0.5 * (60 - 50) = 55.
        assert!((percentile(&values, 50.0) - 55.0).abs() < 1e-9);
        // rank(p0) = 0 => first value.
        assert!((percentile(&values, 0.0) - 10.0).abs() < 1e-9);
        // rank(p100) = 9 => last value.
        assert!((percentile(&values, 100.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn latency_stats_mean_min_max() {
        let stats = latency_stats(vec![10.0, 20.0, 30.0]);
        assert!((stats.mean_ms - 20.0).abs() < 1e-9);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
    }

    #[test]
    fn snapshot_percentiles_reflect_recorded_latencies() {
        let collector = MetricsCollector::new();
        for ms in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            collector.record_result(&success_ms(ms, ms));
        }
        let snap = collector.snapshot();
        assert!((snap.latency.p50_ms - 55.0).abs() < 1e-9);
        assert!((snap.latency.max_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_recording_is_safe() {
        use std::sync::Arc;
        let collector = Arc::new(MetricsCollector::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let collector = Arc::clone(&collector);
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000u64 {
                    collector.record_result(&success_ms(t * 1_000 + i, 5));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("recorder thread");
        }
        let snap = collector.snapshot();
        assert_eq!(snap.total_tasks, 8_000);
        assert_eq!(snap.successful_tasks, 8_000);
    }
}
