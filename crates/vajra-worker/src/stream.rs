use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use vajra_core::engine::TestExecutor;
use vajra_rpc::codec::Connection;
use vajra_rpc::messages::{Request, Response, WorkerMetrics};

/// Reports buffered while the controller is unreachable are dropped once
/// they get older than this.
const BUFFER_MAX_AGE: Duration = Duration::from_secs(60);
/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Long-lived metrics stream from one worker to its controller.
///
/// Every tick the streamer snapshots all known tests and queues one
/// [`WorkerMetrics`] element per test (terminal tests are reported exactly
/// once more so the controller sees their final state). Elements are flushed
/// over a persistent connection; on connection loss they are buffered for up
/// to 60 s with drop-oldest eviction while reconnection is retried with
/// exponential backoff.
pub struct MetricsStreamer {
    controller_addr: String,
    worker_id: String,
    executor: Arc<TestExecutor>,
    period: Duration,
    cancel: CancellationToken,
}

impl MetricsStreamer {
    pub fn new(
        controller_addr: String,
        worker_id: String,
        executor: Arc<TestExecutor>,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            controller_addr,
            worker_id,
            executor,
            period,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut buffer: VecDeque<(Instant, WorkerMetrics)> = VecDeque::new();
        let mut connection: Option<Connection> = None;
        let mut backoff = BACKOFF_INITIAL;
        let mut next_attempt = Instant::now();
        let mut reported_terminal: HashSet<String> = HashSet::new();

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => return,
            }

            self.collect_reports(&mut buffer, &mut reported_terminal).await;
            evict_stale(&mut buffer);

            if buffer.is_empty() {
                continue;
            }

            if connection.is_none() && Instant::now() >= next_attempt {
                match Connection::connect(self.controller_addr.as_str()).await {
                    Ok(conn) => {
                        connection = Some(conn);
                        backoff = BACKOFF_INITIAL;
                        tracing::debug!("metrics stream connected");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "metrics stream connect failed");
                        next_attempt = Instant::now() + backoff;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }

            let mut lost_connection = false;
            if let Some(conn) = connection.as_mut() {
                while let Some((queued_at, metrics)) = buffer.pop_front() {
                    let outcome = conn
                        .round_trip(&Request::StreamMetrics(metrics.clone()))
                        .await;
                    match outcome {
                        Ok(Response::MetricsAck(ack)) if ack.received => {}
                        Ok(other) => {
                            tracing::warn!("unexpected stream response: {other:?}");
                            buffer.push_front((queued_at, metrics));
                            lost_connection = true;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "metrics stream send failed");
                            buffer.push_front((queued_at, metrics));
                            lost_connection = true;
                            break;
                        }
                    }
                }
            }
            if lost_connection {
                connection = None;
                next_attempt = Instant::now() + backoff;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }

    /// Queue one report per known test. Active tests report every tick;
    /// a terminal test reports its final snapshot once and is then muted.
    async fn collect_reports(
        &self,
        buffer: &mut VecDeque<(Instant, WorkerMetrics)>,
        reported_terminal: &mut HashSet<String>,
    ) {
        for execution in self.executor.list().await {
            if execution.status.is_terminal() && reported_terminal.contains(&execution.test_id) {
                continue;
            }
            if execution.status.is_terminal() {
                reported_terminal.insert(execution.test_id.clone());
            }
            let Ok(snapshot) = self.executor.metrics(&execution.test_id).await else {
                continue;
            };
            buffer.push_back((
                Instant::now(),
                WorkerMetrics {
                    worker_id: self.worker_id.clone(),
                    test_id: execution.test_id,
                    status: execution.status,
                    snapshot,
                },
            ));
        }
    }
}

fn evict_stale(buffer: &mut VecDeque<(Instant, WorkerMetrics)>) {
    let now = Instant::now();
    while let Some((queued_at, _)) = buffer.front() {
        if now.duration_since(*queued_at) > BUFFER_MAX_AGE {
            buffer.pop_front();
        } else {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vajra_core::engine::TestStatus;
    use vajra_core::metrics::MetricsSnapshot;

    fn report(test_id: &str) -> WorkerMetrics {
        WorkerMetrics {
            worker_id: "w".to_string(),
            test_id: test_id.to_string(),
            status: TestStatus::Running,
            snapshot: MetricsSnapshot::empty(),
        }
    }

    #[test]
    fn evict_stale_drops_only_old_entries() {
        let mut buffer = VecDeque::new();
        let old = Instant::now() - Duration::from_secs(120);
        buffer.push_back((old, report("old")));
        buffer.push_back((Instant::now(), report("fresh")));

        evict_stale(&mut buffer);

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].1.test_id, "fresh");
    }

    #[test]
    fn evict_stale_keeps_everything_recent() {
        let mut buffer = VecDeque::new();
        buffer.push_back((Instant::now(), report("a")));
        buffer.push_back((Instant::now(), report("b")));
        evict_stale(&mut buffer);
        assert_eq!(buffer.len(), 2);
    }
}
