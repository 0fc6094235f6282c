use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use vajra_rpc::messages::{
    HeartbeatRequest, HeartbeatResponse, RegistrationResponse, WorkerRegistration, WorkerStatus,
    DEFAULT_HEARTBEAT_INTERVAL_SECONDS, DEFAULT_METRICS_INTERVAL_SECONDS,
};

/// How often the health sweeper inspects heartbeat ages.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// Silence beyond this marks a worker UNHEALTHY.
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
/// Additional silence beyond unhealthy before the worker is removed.
const DEFAULT_REMOVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Controller-side view of one registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerInfo {
    pub worker_id: String,
    pub host: String,
    pub rpc_port: u16,
    pub max_capacity: u32,
    pub current_load: u32,
    pub status: WorkerStatus,
    pub last_heartbeat_ms: u64,
    pub supported_task_types: HashSet<String>,
    pub version: String,
}

impl WorkerInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }

    pub fn available_capacity(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_load)
    }
}

struct TrackedWorker {
    info: WorkerInfo,
    last_seen: Instant,
}

/// Registry of workers with heartbeat-driven health tracking.
///
/// Registration and unregistration are serialised behind one mutex; a
/// re-registering worker starts from scratch (fresh load, fresh health).
pub struct WorkerManager {
    workers: Mutex<HashMap<String, TrackedWorker>>,
    heartbeat_timeout: Duration,
    removal_timeout: Duration,
    heartbeat_interval_seconds: u32,
    metrics_interval_seconds: u32,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            removal_timeout: DEFAULT_REMOVAL_TIMEOUT,
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            metrics_interval_seconds: DEFAULT_METRICS_INTERVAL_SECONDS,
        }
    }

    /// Override the intervals prescribed to workers and the health timeouts.
    pub fn with_settings(
        heartbeat_interval_seconds: u32,
        metrics_interval_seconds: u32,
        heartbeat_timeout: Duration,
        removal_timeout: Duration,
    ) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            heartbeat_timeout,
            removal_timeout,
            heartbeat_interval_seconds,
            metrics_interval_seconds,
        }
    }

    pub fn metrics_interval_seconds(&self) -> u32 {
        self.metrics_interval_seconds
    }

    /// Accept a registration, replacing any previous entry for the id.
    pub fn register(&self, registration: WorkerRegistration) -> RegistrationResponse {
        let info = WorkerInfo {
            worker_id: registration.worker_id.clone(),
            host: registration.host,
            rpc_port: registration.rpc_port,
            max_capacity: registration.max_capacity,
            current_load: 0,
            status: WorkerStatus::Healthy,
            last_heartbeat_ms: Utc::now().timestamp_millis() as u64,
            supported_task_types: registration
                .supported_task_types
                .into_iter()
                .map(|t| t.trim().to_uppercase())
                .collect(),
            version: registration.version,
        };
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let replaced = workers
            .insert(
                registration.worker_id.clone(),
                TrackedWorker {
                    info,
                    last_seen: Instant::now(),
                },
            )
            .is_some();
        tracing::info!(worker_id = %registration.worker_id, replaced, "worker registered");

        RegistrationResponse {
            accepted: true,
            message: "registered".to_string(),
            heartbeat_interval_seconds: self.heartbeat_interval_seconds,
            metrics_interval_seconds: self.metrics_interval_seconds,
        }
    }

    /// Record a heartbeat. Unknown workers are told to re-register.
    pub fn heartbeat(&self, request: &HeartbeatRequest) -> HeartbeatResponse {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match workers.get_mut(&request.worker_id) {
            Some(tracked) => {
                tracked.last_seen = Instant::now();
                tracked.info.last_heartbeat_ms = request.timestamp_ms;
                tracked.info.current_load = request.current_load;
                tracked.info.status = match request.status {
                    WorkerStatus::Draining => WorkerStatus::Draining,
                    _ => WorkerStatus::Healthy,
                };
                HeartbeatResponse {
                    healthy: true,
                    message: "ok".to_string(),
                }
            }
            None => HeartbeatResponse {
                healthy: false,
                message: "unknown worker, re-register".to_string(),
            },
        }
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut infos: Vec<WorkerInfo> = workers.values().map(|t| t.info.clone()).collect();
        infos.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        infos
    }

    /// HEALTHY workers whose supported task types include `task_type`.
    pub fn healthy_workers_supporting(&self, task_type: &str) -> Vec<WorkerInfo> {
        let canonical = task_type.trim().to_uppercase();
        self.workers()
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Healthy)
            .filter(|w| w.supported_task_types.contains(&canonical))
            .collect()
    }

    /// Book additional load against a worker after a successful assignment.
    pub fn add_load(&self, worker_id: &str, tps: u32) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tracked) = workers.get_mut(worker_id) {
            tracked.info.current_load = tracked.info.current_load.saturating_add(tps);
        }
    }

    /// Mark a worker UNREACHABLE after a failed dial-back. The next
    /// heartbeat restores it to HEALTHY; until then it is excluded from
    /// distribution.
    pub fn mark_unreachable(&self, worker_id: &str) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tracked) = workers.get_mut(worker_id) {
            if tracked.info.status != WorkerStatus::Draining {
                tracing::warn!(%worker_id, "worker marked unreachable");
                tracked.info.status = WorkerStatus::Unreachable;
            }
        }
    }

    /// Return load when a worker's share of a test finishes.
    pub fn release_load(&self, worker_id: &str, tps: u32) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tracked) = workers.get_mut(worker_id) {
            tracked.info.current_load = tracked.info.current_load.saturating_sub(tps);
        }
    }

    /// One health pass: silence beyond the heartbeat timeout marks a worker
    /// UNHEALTHY; silence beyond that plus the removal timeout deletes it.
    pub fn sweep(&self) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let mut to_remove: Vec<String> = Vec::new();
        for (worker_id, tracked) in workers.iter_mut() {
            let silence = now.duration_since(tracked.last_seen);
            if silence > self.heartbeat_timeout + self.removal_timeout {
                to_remove.push(worker_id.clone());
            } else if silence > self.heartbeat_timeout
                && tracked.info.status == WorkerStatus::Healthy
            {
                tracing::warn!(%worker_id, ?silence, "worker marked unhealthy");
                tracked.info.status = WorkerStatus::Unhealthy;
            }
        }
        for worker_id in to_remove {
            tracing::warn!(%worker_id, "worker removed after prolonged silence");
            workers.remove(&worker_id);
        }
    }

    /// Background sweeper; runs until the token is cancelled.
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = cancel.cancelled() => return,
            }
        }
    }
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(worker_id: &str, capacity: u32) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: worker_id.to_string(),
            host: "127.0.0.1".to_string(),
            rpc_port: 9091,
            max_capacity: capacity,
            supported_task_types: vec!["SLEEP".to_string(), "HTTP_GET".to_string()],
            version: "0.1.0".to_string(),
        }
    }

    fn heartbeat_from(worker_id: &str, load: u32) -> HeartbeatRequest {
        HeartbeatRequest {
            worker_id: worker_id.to_string(),
            current_load: load,
            status: WorkerStatus::Healthy,
            timestamp_ms: Utc::now().timestamp_millis() as u64,
        }
    }

    #[test]
    fn register_accepts_and_prescribes_intervals() {
        let manager = WorkerManager::new();
        let response = manager.register(registration("w1", 1000));
        assert!(response.accepted);
        assert_eq!(
            response.heartbeat_interval_seconds,
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS
        );
        assert_eq!(manager.workers().len(), 1);
        assert_eq!(manager.workers()[0].status, WorkerStatus::Healthy);
    }

    #[test]
    fn reregistration_resets_worker_state() {
        let manager = WorkerManager::new();
        manager.register(registration("w1", 1000));
        manager.add_load("w1", 400);
        assert_eq!(manager.workers()[0].current_load, 400);

        manager.register(registration("w1", 2000));
        let info = &manager.workers()[0];
        assert_eq!(info.current_load, 0);
        assert_eq!(info.max_capacity, 2000);
    }

    #[test]
    fn heartbeat_updates_load_and_known_worker() {
        let manager = WorkerManager::new();
        manager.register(registration("w1", 1000));
        let response = manager.heartbeat(&heartbeat_from("w1", 250));
        assert!(response.healthy);
        assert_eq!(manager.workers()[0].current_load, 250);
    }

    #[test]
    fn heartbeat_from_unknown_worker_requests_reregistration() {
        let manager = WorkerManager::new();
        let response = manager.heartbeat(&heartbeat_from("ghost", 0));
        assert!(!response.healthy);
        assert!(response.message.contains("re-register"));
    }

    #[test]
    fn draining_heartbeat_marks_worker_draining() {
        let manager = WorkerManager::new();
        manager.register(registration("w1", 1000));
        let mut hb = heartbeat_from("w1", 0);
        hb.status = WorkerStatus::Draining;
        manager.heartbeat(&hb);
        assert_eq!(manager.workers()[0].status, WorkerStatus::Draining);
    }

    #[test]
    fn filtering_by_task_type_is_case_insensitive() {
        let manager = WorkerManager::new();
        manager.register(registration("w1", 1000));
        assert_eq!(manager.healthy_workers_supporting("sleep").len(), 1);
        assert_eq!(manager.healthy_workers_supporting("CPU").len(), 0);
    }

    #[test]
    fn sweep_marks_silent_workers_unhealthy_then_removes() {
        let manager = WorkerManager::with_settings(
            1,
            1,
            Duration::from_millis(0),
            Duration::from_millis(0),
        );
        manager.register(registration("w1", 1000));
        // With zero timeouts any measurable silence removes the worker;
        // an intermediate sweep with only the heartbeat timeout elapsed
        // would mark it unhealthy first.
        std::thread::sleep(Duration::from_millis(5));
        manager.sweep();
        assert!(manager.workers().is_empty());
    }

    #[test]
    fn sweep_unhealthy_before_removal() {
        let manager = WorkerManager::with_settings(
            1,
            1,
            Duration::from_millis(0),
            Duration::from_secs(3600),
        );
        manager.register(registration("w1", 1000));
        std::thread::sleep(Duration::from_millis(5));
        manager.sweep();
        let workers = manager.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].status, WorkerStatus::Unhealthy);
        // Unhealthy workers are excluded from distribution.
        assert!(manager.healthy_workers_supporting("SLEEP").is_empty());
    }

    #[test]
    fn unreachable_worker_is_excluded_until_next_heartbeat() {
        let manager = WorkerManager::new();
        manager.register(registration("w1", 1000));
        manager.mark_unreachable("w1");
        assert_eq!(manager.workers()[0].status, WorkerStatus::Unreachable);
        assert!(manager.healthy_workers_supporting("SLEEP").is_empty());

        // A heartbeat proves the worker is alive again.
        manager.heartbeat(&heartbeat_from("w1", 0));
        assert_eq!(manager.workers()[0].status, WorkerStatus::Healthy);
        assert_eq!(manager.healthy_workers_supporting("SLEEP").len(), 1);
    }

    #[test]
    fn mark_unreachable_does_not_override_draining() {
        let manager = WorkerManager::new();
        manager.register(registration("w1", 1000));
        let mut hb = heartbeat_from("w1", 0);
        hb.status = WorkerStatus::Draining;
        manager.heartbeat(&hb);
        manager.mark_unreachable("w1");
        assert_eq!(manager.workers()[0].status, WorkerStatus::Draining);
    }

    #[test]
    fn load_bookkeeping_saturates() {
        let manager = WorkerManager::new();
        manager.register(registration("w1", 1000));
        manager.release_load("w1", 500);
        assert_eq!(manager.workers()[0].current_load, 0);
        manager.add_load("w1", 400);
        manager.release_load("w1", 100);
        assert_eq!(manager.workers()[0].current_load, 300);
    }

    #[test]
    fn available_capacity_subtracts_load() {
        let manager = WorkerManager::new();
        manager.register(registration("w1", 1000));
        manager.add_load("w1", 400);
        assert_eq!(manager.workers()[0].available_capacity(), 600);
    }
}
