use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use vajra_core::engine::TestStatus;
use vajra_core::error::VajraError;
use vajra_core::metrics::MetricsSnapshot;
use vajra_rpc::codec::{call, Connection, CONTROL_CALL_TIMEOUT};
use vajra_rpc::messages::{MetricsAck, Request, Response, StopRequest, WorkerMetrics};

use crate::aggregator::MetricsAggregator;
use crate::distributor::{DistributedTestRequest, TaskDistributor, WorkerShare};
use crate::registry::WorkerManager;

/// Tunables for one controller process.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub min_workers: usize,
    pub heartbeat_interval_seconds: u32,
    pub metrics_interval_seconds: u32,
    pub heartbeat_timeout: Duration,
    pub removal_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            min_workers: 1,
            heartbeat_interval_seconds: 10,
            metrics_interval_seconds: 5,
            heartbeat_timeout: Duration::from_secs(30),
            removal_timeout: Duration::from_secs(60),
        }
    }
}

struct DistributedTest {
    request: DistributedTestRequest,
    shares: Vec<WorkerShare>,
    /// Shares whose load has been given back after a terminal report.
    released: HashSet<String>,
    stop_requested: bool,
    started_at: DateTime<Utc>,
}

/// External view of a distributed test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DistributedTestStatus {
    pub test_id: String,
    pub task_type: String,
    pub target_tps: u32,
    pub status: TestStatus,
    /// Worker-local statuses from the latest stream reports; workers that
    /// have not reported yet are absent.
    pub workers: HashMap<String, TestStatus>,
    pub assigned_workers: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// The controller: worker registry, health monitor, task distribution,
/// metrics aggregation, and the distributed test lifecycle, behind one RPC
/// endpoint.
pub struct Coordinator {
    manager: Arc<WorkerManager>,
    aggregator: Arc<MetricsAggregator>,
    distributor: TaskDistributor,
    tests: Mutex<HashMap<String, DistributedTest>>,
}

impl Coordinator {
    pub fn new(settings: ControllerSettings) -> Self {
        let manager = Arc::new(WorkerManager::with_settings(
            settings.heartbeat_interval_seconds,
            settings.metrics_interval_seconds,
            settings.heartbeat_timeout,
            settings.removal_timeout,
        ));
        let aggregator = Arc::new(MetricsAggregator::with_stale_after(Duration::from_secs(
            3 * u64::from(settings.metrics_interval_seconds.max(1)),
        )));
        let distributor = TaskDistributor::new(Arc::clone(&manager), settings.min_workers);
        Self {
            manager,
            aggregator,
            distributor,
            tests: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> Arc<WorkerManager> {
        Arc::clone(&self.manager)
    }

    /// Distribute a test across the healthy worker pool.
    pub async fn start_test(&self, request: DistributedTestRequest) -> Result<String, VajraError> {
        {
            let tests = self.tests.lock().await;
            if tests.contains_key(&request.test_id) {
                return Err(VajraError::Lifecycle(format!(
                    "distributed test {} already exists",
                    request.test_id
                )));
            }
        }

        let shares = self.distributor.distribute(&request).await?;
        let test_id = request.test_id.clone();
        let mut tests = self.tests.lock().await;
        tests.insert(
            test_id.clone(),
            DistributedTest {
                request,
                shares,
                released: HashSet::new(),
                stop_requested: false,
                started_at: Utc::now(),
            },
        );
        Ok(test_id)
    }

    /// Ask every assigned worker to stop its share.
    pub async fn stop_test(&self, test_id: &str, graceful: bool) -> Result<(), VajraError> {
        let shares = {
            let mut tests = self.tests.lock().await;
            let test = tests
                .get_mut(test_id)
                .ok_or_else(|| VajraError::NotFound(test_id.to_string()))?;
            if test.stop_requested {
                return Err(VajraError::Lifecycle(format!(
                    "distributed test {test_id} is already stopping"
                )));
            }
            test.stop_requested = true;
            test.shares.clone()
        };

        for share in &shares {
            let stop = Request::StopTest(StopRequest {
                test_id: test_id.to_string(),
                graceful,
            });
            if let Err(e) = call(share.addr.as_str(), &stop, CONTROL_CALL_TIMEOUT).await {
                tracing::warn!(
                    worker_id = %share.worker_id,
                    error = %e,
                    "stop delivery failed; worker will finish on its own"
                );
                if e.is_transport() {
                    self.manager.mark_unreachable(&share.worker_id);
                }
            }
        }
        Ok(())
    }

    /// Resolve the distributed lifecycle from the latest worker reports:
    /// any FAILED worker fails the test; all COMPLETED completes it; an
    /// explicit stop resolves to STOPPED once every reporting worker is
    /// terminal; otherwise the test is still RUNNING.
    pub async fn status(&self, test_id: &str) -> Result<DistributedTestStatus, VajraError> {
        let (assigned, stop_requested, started_at, task_type, target_tps) = {
            let tests = self.tests.lock().await;
            let test = tests
                .get(test_id)
                .ok_or_else(|| VajraError::NotFound(test_id.to_string()))?;
            (
                test.shares.iter().map(|s| s.worker_id.clone()).collect::<Vec<_>>(),
                test.stop_requested,
                test.started_at,
                test.request.task_type.clone(),
                test.request.target_tps,
            )
        };

        let workers = self.aggregator.worker_statuses(test_id);

        let any_failed = workers.values().any(|s| *s == TestStatus::Failed);
        let all_reported_terminal = !workers.is_empty()
            && assigned
                .iter()
                .all(|w| workers.get(w).is_some_and(|s| s.is_terminal()));
        let all_completed = all_reported_terminal
            && assigned
                .iter()
                .all(|w| workers.get(w) == Some(&TestStatus::Completed));

        let status = if any_failed {
            TestStatus::Failed
        } else if stop_requested {
            if all_reported_terminal {
                TestStatus::Stopped
            } else {
                TestStatus::Stopping
            }
        } else if all_completed {
            TestStatus::Completed
        } else if all_reported_terminal {
            TestStatus::Stopped
        } else {
            TestStatus::Running
        };

        Ok(DistributedTestStatus {
            test_id: test_id.to_string(),
            task_type,
            target_tps,
            status,
            workers,
            assigned_workers: assigned,
            started_at,
        })
    }

    /// Aggregated metrics for a distributed test.
    pub async fn metrics(&self, test_id: &str) -> Result<MetricsSnapshot, VajraError> {
        {
            let tests = self.tests.lock().await;
            if !tests.contains_key(test_id) {
                return Err(VajraError::NotFound(test_id.to_string()));
            }
        }
        Ok(self
            .aggregator
            .aggregate(test_id)
            .unwrap_or_else(MetricsSnapshot::empty))
    }

    pub async fn list(&self) -> Vec<DistributedTestStatus> {
        let test_ids: Vec<String> = {
            let tests = self.tests.lock().await;
            tests.keys().cloned().collect()
        };
        let mut statuses = Vec::with_capacity(test_ids.len());
        for test_id in test_ids {
            if let Ok(status) = self.status(&test_id).await {
                statuses.push(status);
            }
        }
        statuses.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        statuses
    }

    /// Ingest one metrics stream element; releases the worker's booked load
    /// the first time its share of a test reports terminal.
    async fn handle_stream(&self, metrics: WorkerMetrics) -> MetricsAck {
        if metrics.status.is_terminal() {
            let mut tests = self.tests.lock().await;
            if let Some(test) = tests.get_mut(&metrics.test_id) {
                if test.released.insert(metrics.worker_id.clone()) {
                    let share_tps = test
                        .shares
                        .iter()
                        .find(|s| s.worker_id == metrics.worker_id)
                        .map_or(0, |s| s.tps);
                    self.manager.release_load(&metrics.worker_id, share_tps);
                }
            }
        }
        self.aggregator.record(metrics);
        MetricsAck { received: true }
    }

    /// Dispatch one worker-originated request.
    pub async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::RegisterWorker(registration) => {
                Response::Registration(self.manager.register(registration))
            }
            Request::Heartbeat(heartbeat) => {
                Response::Heartbeat(self.manager.heartbeat(&heartbeat))
            }
            Request::StreamMetrics(metrics) => {
                Response::MetricsAck(self.handle_stream(metrics).await)
            }
            other => Response::Error {
                message: format!("controller does not serve this request: {other:?}"),
            },
        }
    }

    /// Serve the controller endpoint until cancelled. Also runs the health
    /// sweeper in the background.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        let sweeper_manager = self.manager();
        let sweeper_cancel = cancel.clone();
        tokio::spawn(async move {
            sweeper_manager.run_sweeper(sweeper_cancel).await;
        });

        tracing::info!(
            addr = ?listener.local_addr().ok(),
            "controller RPC endpoint listening"
        );
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    tracing::debug!(%peer, "worker connection accepted");
                    let coordinator = Arc::clone(&self);
                    tokio::spawn(async move {
                        let mut connection = Connection::from_stream(stream);
                        while let Ok(Some(request)) = connection.read_request().await {
                            let response = coordinator.handle_request(request).await;
                            if connection.send_response(&response).await.is_err() {
                                return;
                            }
                        }
                    });
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
