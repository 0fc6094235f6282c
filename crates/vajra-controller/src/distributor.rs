use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use vajra_core::error::VajraError;
use vajra_rpc::codec::{call, CONTROL_CALL_TIMEOUT};
use vajra_rpc::messages::{RampConfig, Request, Response, StopRequest, TaskAssignment};

use crate::registry::{WorkerInfo, WorkerManager};

/// A distributed test as requested through the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DistributedTestRequest {
    pub test_id: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub target_tps: u32,
    pub duration_seconds: u64,
    pub max_concurrency: u32,
    pub ramp: RampConfig,
}

/// One worker's accepted share of a distributed test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerShare {
    pub worker_id: String,
    pub addr: String,
    pub tps: u32,
}

/// Split `target_tps` across workers proportionally to their available
/// capacity. Workers arrive pre-sorted (capacity descending, id ascending);
/// the flooring remainder is absorbed by the first worker.
pub fn allocate_shares(workers: &[(String, u32)], target_tps: u32) -> Vec<(String, u32)> {
    let pool: u64 = workers.iter().map(|(_, avail)| u64::from(*avail)).sum();
    if pool == 0 || workers.is_empty() {
        return workers.iter().map(|(id, _)| (id.clone(), 0)).collect();
    }

    let mut shares: Vec<(String, u32)> = workers
        .iter()
        .map(|(id, avail)| {
            let share = u64::from(target_tps) * u64::from(*avail) / pool;
            (id.clone(), share as u32)
        })
        .collect();

    let allocated: u64 = shares.iter().map(|(_, tps)| u64::from(*tps)).sum();
    let remainder = u64::from(target_tps) - allocated;
    shares[0].1 = shares[0].1.saturating_add(remainder as u32);
    shares
}

/// Dispatches distributed test requests to the healthy worker pool.
pub struct TaskDistributor {
    manager: Arc<WorkerManager>,
    min_workers: usize,
}

impl TaskDistributor {
    pub fn new(manager: Arc<WorkerManager>, min_workers: usize) -> Self {
        Self {
            manager,
            min_workers: min_workers.max(1),
        }
    }

    /// Select workers, compute shares, and emit the assignments.
    ///
    /// If any worker rejects or is unreachable, already-assigned workers get
    /// a best-effort `StopTest` and the whole request fails.
    pub async fn distribute(
        &self,
        request: &DistributedTestRequest,
    ) -> Result<Vec<WorkerShare>, VajraError> {
        let mut candidates = self.manager.healthy_workers_supporting(&request.task_type);
        // Deterministic order: available capacity descending, then id.
        candidates.sort_by(|a, b| {
            b.available_capacity()
                .cmp(&a.available_capacity())
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });

        if candidates.len() < self.min_workers {
            return Err(VajraError::Coordination(format!(
                "insufficient workers: {} available, {} required",
                candidates.len(),
                self.min_workers
            )));
        }

        let capacities: Vec<(String, u32)> = candidates
            .iter()
            .map(|w| (w.worker_id.clone(), w.available_capacity()))
            .collect();
        if capacities.iter().all(|(_, avail)| *avail == 0) && request.target_tps > 0 {
            return Err(VajraError::Coordination(
                "worker pool has no available capacity".to_string(),
            ));
        }
        let shares = allocate_shares(&capacities, request.target_tps);

        let by_id: HashMap<&str, &WorkerInfo> = candidates
            .iter()
            .map(|w| (w.worker_id.as_str(), w))
            .collect();

        let mut assigned: Vec<WorkerShare> = Vec::with_capacity(shares.len());
        for (worker_id, tps) in &shares {
            let worker = by_id[worker_id.as_str()];
            let assignment = TaskAssignment {
                test_id: request.test_id.clone(),
                task_type: request.task_type.clone(),
                parameters: request.parameters.clone(),
                target_tps: *tps,
                duration_seconds: request.duration_seconds,
                max_concurrency: request.max_concurrency,
                ramp: request.ramp.clone(),
            };

            let outcome = call(
                worker.addr().as_str(),
                &Request::AssignTask(assignment),
                CONTROL_CALL_TIMEOUT,
            )
            .await;

            let failure = match outcome {
                Ok(Response::TaskAssignment(response)) if response.accepted => {
                    assigned.push(WorkerShare {
                        worker_id: worker_id.clone(),
                        addr: worker.addr(),
                        tps: *tps,
                    });
                    None
                }
                Ok(Response::TaskAssignment(response)) => Some(response.message),
                Ok(other) => Some(format!("unexpected response: {other:?}")),
                Err(e) => {
                    if e.is_transport() {
                        self.manager.mark_unreachable(worker_id);
                    }
                    Some(e.to_string())
                }
            };

            if let Some(reason) = failure {
                tracing::warn!(%worker_id, %reason, "assignment failed, rolling back");
                self.rollback(&request.test_id, &assigned).await;
                return Err(VajraError::Coordination(format!(
                    "assignment to {worker_id} failed: {reason}"
                )));
            }
        }

        for share in &assigned {
            self.manager.add_load(&share.worker_id, share.tps);
        }
        tracing::info!(
            test_id = %request.test_id,
            workers = assigned.len(),
            "distributed test assigned"
        );
        Ok(assigned)
    }

    /// Best-effort stop for workers that already accepted the test.
    async fn rollback(&self, test_id: &str, assigned: &[WorkerShare]) {
        for share in assigned {
            let stop = Request::StopTest(StopRequest {
                test_id: test_id.to_string(),
                graceful: false,
            });
            if let Err(e) = call(share.addr.as_str(), &stop, CONTROL_CALL_TIMEOUT).await {
                tracing::warn!(worker_id = %share.worker_id, error = %e, "rollback stop failed");
                if e.is_transport() {
                    self.manager.mark_unreachable(&share.worker_id);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
