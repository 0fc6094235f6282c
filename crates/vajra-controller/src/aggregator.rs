use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;

use vajra_core::engine::TestStatus;
use vajra_core::metrics::{LatencyStats, MetricsSnapshot};
use vajra_rpc::messages::{WorkerMetrics, DEFAULT_METRICS_INTERVAL_SECONDS};

struct TimedReport {
    received_at: Instant,
    metrics: WorkerMetrics,
}

/// Merges per-worker metric streams into one cluster-level snapshot per test.
///
/// Only the most recent report per (test, worker) is kept. Reports older
/// than the staleness cutoff (3× the stream interval) are excluded from
/// aggregation — a worker that went silent simply stops contributing, which
/// surfaces as a drop in aggregate TPS.
pub struct MetricsAggregator {
    reports: Mutex<HashMap<String, HashMap<String, TimedReport>>>,
    stale_after: Duration,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::with_stale_after(Duration::from_secs(
            3 * u64::from(DEFAULT_METRICS_INTERVAL_SECONDS),
        ))
    }

    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            reports: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Keep this report as the latest for its (test, worker) pair.
    pub fn record(&self, metrics: WorkerMetrics) {
        let mut reports = self
            .reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reports
            .entry(metrics.test_id.clone())
            .or_default()
            .insert(
                metrics.worker_id.clone(),
                TimedReport {
                    received_at: Instant::now(),
                    metrics,
                },
            );
    }

    /// Worker-local test statuses from the latest reports, stale or not —
    /// lifecycle resolution must still see a final COMPLETED that arrived a
    /// while ago.
    pub fn worker_statuses(&self, test_id: &str) -> HashMap<String, TestStatus> {
        let reports = self
            .reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reports
            .get(test_id)
            .map(|by_worker| {
                by_worker
                    .iter()
                    .map(|(worker_id, report)| (worker_id.clone(), report.metrics.status))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cluster-level snapshot for `test_id`, or `None` for an unknown test.
    ///
    /// Counters and TPS are summed. Percentiles are the task-count-weighted
    /// mean of per-worker percentiles — an approximation that is biased for
    /// skewed per-worker distributions but needs no raw-sample streaming.
    pub fn aggregate(&self, test_id: &str) -> Option<MetricsSnapshot> {
        let reports = self
            .reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let by_worker = reports.get(test_id)?;

        let now = Instant::now();
        let fresh: Vec<&MetricsSnapshot> = by_worker
            .values()
            .filter(|r| now.duration_since(r.received_at) <= self.stale_after)
            .map(|r| &r.metrics.snapshot)
            .collect();

        let mut total_tasks = 0u64;
        let mut successful_tasks = 0u64;
        let mut failed_tasks = 0u64;
        let mut active_tasks = 0i64;
        let mut current_tps = 0.0f64;
        let mut error_counts: HashMap<String, u64> = HashMap::new();

        // Weighted-percentile accumulators over workers with samples.
        let mut weight = 0u64;
        let mut p50_acc = 0.0f64;
        let mut p95_acc = 0.0f64;
        let mut p99_acc = 0.0f64;
        let mut mean_acc = 0.0f64;
        let mut min_ms = f64::MAX;
        let mut max_ms = 0.0f64;

        for snapshot in &fresh {
            total_tasks += snapshot.total_tasks;
            successful_tasks += snapshot.successful_tasks;
            failed_tasks += snapshot.failed_tasks;
            active_tasks += snapshot.active_tasks;
            current_tps += snapshot.current_tps;
            for (kind, count) in &snapshot.error_counts {
                *error_counts.entry(kind.clone()).or_insert(0) += count;
            }

            if snapshot.total_tasks > 0 {
                let w = snapshot.total_tasks as f64;
                weight += snapshot.total_tasks;
                p50_acc += snapshot.latency.p50_ms * w;
                p95_acc += snapshot.latency.p95_ms * w;
                p99_acc += snapshot.latency.p99_ms * w;
                mean_acc += snapshot.latency.mean_ms * w;
                min_ms = min_ms.min(snapshot.latency.min_ms);
                max_ms = max_ms.max(snapshot.latency.max_ms);
            }
        }

        let latency = if weight > 0 {
            let w = weight as f64;
            LatencyStats {
                p50_ms: p50_acc / w,
                p95_ms: p95_acc / w,
                p99_ms: p99_acc / w,
                mean_ms: mean_acc / w,
                min_ms,
                max_ms,
            }
        } else {
            LatencyStats::default()
        };

        let error_rate = if total_tasks > 0 {
            failed_tasks as f64 / total_tasks as f64 * 100.0
        } else {
            0.0
        };

        Some(MetricsSnapshot {
            total_tasks,
            successful_tasks,
            failed_tasks,
            active_tasks,
            current_tps,
            error_rate,
            latency,
            error_counts,
            timestamp_ms: Utc::now().timestamp_millis() as u64,
        })
    }

    /// Forget a test entirely (stale-test cleanup after retrieval).
    pub fn remove_test(&self, test_id: &str) {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(test_id);
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
