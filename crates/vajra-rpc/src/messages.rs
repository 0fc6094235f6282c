use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use vajra_core::engine::TestStatus;
use vajra_core::metrics::MetricsSnapshot;

/// Default controller RPC port.
pub const CONTROLLER_PORT: u16 = 9090;
/// First worker RPC port; additional workers on one host count upwards.
pub const WORKER_BASE_PORT: u16 = 9091;

/// Default interval the controller prescribes for worker heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u32 = 10;
/// Default interval between metrics stream elements.
pub const DEFAULT_METRICS_INTERVAL_SECONDS: u32 = 5;

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Health state of a worker as tracked by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    #[default]
    Healthy,
    /// Heartbeats have gone silent past the timeout.
    Unhealthy,
    /// The controller failed to dial the worker's RPC endpoint; cleared by
    /// the next heartbeat.
    Unreachable,
    /// Worker is finishing its tests and will not accept new assignments.
    Draining,
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// A worker announcing itself to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub host: String,
    pub rpc_port: u16,
    /// Capacity in target TPS the worker is willing to carry.
    pub max_capacity: u32,
    pub supported_task_types: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RegistrationResponse {
    pub accepted: bool,
    pub message: String,
    pub heartbeat_interval_seconds: u32,
    pub metrics_interval_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatRequest {
    pub worker_id: String,
    /// Sum of target TPS across the worker's running tests.
    pub current_load: u32,
    pub status: WorkerStatus,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatResponse {
    pub healthy: bool,
    pub message: String,
}

/// Ramp parameters carried inside an assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RampConfig {
    pub kind: RampKind,
    pub starting_concurrency: u32,
    pub step: u32,
    pub interval_seconds: u32,
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RampKind {
    #[default]
    Linear,
    Step,
}

/// Controller → worker instruction to run a share of a distributed test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskAssignment {
    pub test_id: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub target_tps: u32,
    pub duration_seconds: u64,
    pub max_concurrency: u32,
    pub ramp: RampConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentErrorCode {
    #[default]
    None,
    DuplicateAssignment,
    InvalidConfig,
    TooManyTests,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskAssignmentResponse {
    pub accepted: bool,
    pub message: String,
    pub error_code: AssignmentErrorCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StopRequest {
    pub test_id: String,
    pub graceful: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StopResponse {
    pub stopped: bool,
    pub message: String,
}

/// One element of the worker → controller metrics stream: a full local
/// snapshot plus the worker-local test status so the controller can resolve
/// the distributed lifecycle without extra calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerMetrics {
    pub worker_id: String,
    pub test_id: String,
    pub status: TestStatus,
    pub snapshot: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsAck {
    pub received: bool,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Every request that can travel over a VajraEdge RPC connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    RegisterWorker(WorkerRegistration),
    Heartbeat(HeartbeatRequest),
    AssignTask(TaskAssignment),
    StopTest(StopRequest),
    StreamMetrics(WorkerMetrics),
}

/// Every response. `Error` is the catch-all for protocol-level failures
/// (unexpected request type, internal dispatch errors).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Registration(RegistrationResponse),
    Heartbeat(HeartbeatResponse),
    TaskAssignment(TaskAssignmentResponse),
    Stop(StopResponse),
    MetricsAck(MetricsAck),
    Error { message: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_roundtrip() {
        let request = Request::Heartbeat(HeartbeatRequest {
            worker_id: "worker-1".to_string(),
            current_load: 250,
            status: WorkerStatus::Healthy,
            timestamp_ms: 1_700_000_000_000,
        });
        let json = serde_json::to_string(&request).expect("serialize");
        assert!(json.contains("\"type\":\"heartbeat\""));
        let parsed: Request = serde_json::from_str(&json).expect("deserialize");
        match parsed {
            Request::Heartbeat(hb) => {
                assert_eq!(hb.worker_id, "worker-1");
                assert_eq!(hb.current_load, 250);
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn assignment_roundtrip_preserves_ramp() {
        let assignment = TaskAssignment {
            test_id: "dist-1".to_string(),
            task_type: "HTTP_GET".to_string(),
            parameters: HashMap::from([("url".to_string(), "https://example.com".to_string())]),
            target_tps: 5_000,
            duration_seconds: 300,
            max_concurrency: 1_000,
            ramp: RampConfig {
                kind: RampKind::Step,
                starting_concurrency: 10,
                step: 50,
                interval_seconds: 15,
                duration_seconds: 0,
            },
        };
        let json = serde_json::to_string(&Request::AssignTask(assignment)).expect("serialize");
        let parsed: Request = serde_json::from_str(&json).expect("deserialize");
        match parsed {
            Request::AssignTask(a) => {
                assert_eq!(a.ramp.kind, RampKind::Step);
                assert_eq!(a.ramp.step, 50);
                assert_eq!(a.target_tps, 5_000);
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn worker_status_wire_names() {
        let json = serde_json::to_string(&WorkerStatus::Draining).expect("serialize");
        assert_eq!(json, "\"DRAINING\"");
        let parsed: WorkerStatus = serde_json::from_str("\"UNHEALTHY\"").expect("deserialize");
        assert_eq!(parsed, WorkerStatus::Unhealthy);
    }

    #[test]
    fn error_response_roundtrip() {
        let response = Response::Error {
            message: "unexpected request".to_string(),
        };
        let json = serde_json::to_string(&response).expect("serialize");
        let parsed: Response = serde_json::from_str(&json).expect("deserialize");
        match parsed {
            Response::Error { message } => assert_eq!(message, "unexpected request"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn worker_metrics_carries_status_and_snapshot() {
        let metrics = WorkerMetrics {
            worker_id: "worker-1".to_string(),
            test_id: "dist-1".to_string(),
            status: TestStatus::Sustaining,
            snapshot: MetricsSnapshot::empty(),
        };
        let json = serde_json::to_string(&Request::StreamMetrics(metrics)).expect("serialize");
        let parsed: Request = serde_json::from_str(&json).expect("deserialize");
        match parsed {
            Request::StreamMetrics(m) => {
                assert_eq!(m.status, TestStatus::Sustaining);
                assert_eq!(m.snapshot.total_tasks, 0);
            }
            other => panic!("expected stream metrics, got {other:?}"),
        }
    }
}
