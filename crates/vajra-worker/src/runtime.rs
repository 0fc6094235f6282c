use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vajra_core::config::{RampStrategyKind, TestConfig, TestMode};
use vajra_core::engine::TestExecutor;
use vajra_core::error::VajraError;
use vajra_core::preflight::PreflightValidator;
use vajra_core::task::TaskRegistry;
use vajra_rpc::codec::{call, Connection, HEARTBEAT_CALL_TIMEOUT};
use vajra_rpc::messages::{
    AssignmentErrorCode, HeartbeatRequest, RampKind, RegistrationResponse, Request, Response,
    StopResponse, TaskAssignment, TaskAssignmentResponse, WorkerRegistration, WorkerStatus,
    DEFAULT_HEARTBEAT_INTERVAL_SECONDS, DEFAULT_METRICS_INTERVAL_SECONDS, WORKER_BASE_PORT,
};

use crate::stream::MetricsStreamer;

/// Budget for draining local tests on worker shutdown.
const SHUTDOWN_DRAIN_POLL: Duration = Duration::from_millis(200);
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// Static configuration of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Host the controller should dial back for assignments.
    pub host: String,
    pub rpc_port: u16,
    pub controller_addr: String,
    /// Capacity in target TPS this worker is willing to carry.
    pub max_capacity: u32,
    /// Empty means "everything the local registry knows".
    pub supported_task_types: Vec<String>,
}

impl WorkerConfig {
    pub fn new(controller_addr: impl Into<String>) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            host: "127.0.0.1".to_string(),
            rpc_port: WORKER_BASE_PORT,
            controller_addr: controller_addr.into(),
            max_capacity: 1_000,
            supported_task_types: Vec::new(),
        }
    }
}

/// Prescribed by the controller at registration time.
#[derive(Debug, Clone, Copy)]
struct StreamIntervals {
    heartbeat_seconds: u32,
    metrics_seconds: u32,
}

impl Default for StreamIntervals {
    fn default() -> Self {
        Self {
            heartbeat_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            metrics_seconds: DEFAULT_METRICS_INTERVAL_SECONDS,
        }
    }
}

/// A worker process: hosts a local test executor, serves assignment RPCs,
/// and reports back to its controller via heartbeats and a metrics stream.
pub struct WorkerRuntime {
    config: WorkerConfig,
    executor: Arc<TestExecutor>,
    /// Target TPS per test id ever assigned here; the key set doubles as the
    /// duplicate-assignment guard.
    assignments: Mutex<HashMap<String, u32>>,
    intervals: std::sync::RwLock<StreamIntervals>,
    cancel: CancellationToken,
}

impl WorkerRuntime {
    pub fn new(mut config: WorkerConfig, registry: Arc<TaskRegistry>) -> Self {
        if config.supported_task_types.is_empty() {
            config.supported_task_types = registry.task_types();
        }
        let executor = Arc::new(TestExecutor::new(
            registry,
            Arc::new(PreflightValidator::with_builtin_checks()),
        ));
        Self {
            config,
            executor,
            assignments: Mutex::new(HashMap::new()),
            intervals: std::sync::RwLock::new(StreamIntervals::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn executor(&self) -> Arc<TestExecutor> {
        Arc::clone(&self.executor)
    }

    /// Token that stops the runtime when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Announce this worker to the controller and adopt the prescribed
    /// heartbeat and metrics intervals.
    pub async fn register(&self) -> Result<RegistrationResponse, VajraError> {
        self.register_on_port(self.config.rpc_port).await
    }

    /// Register advertising `rpc_port`, which may differ from the configured
    /// one when the endpoint was bound to an ephemeral port.
    async fn register_on_port(&self, rpc_port: u16) -> Result<RegistrationResponse, VajraError> {
        let registration = WorkerRegistration {
            worker_id: self.config.worker_id.clone(),
            host: self.config.host.clone(),
            rpc_port,
            max_capacity: self.config.max_capacity,
            supported_task_types: self.config.supported_task_types.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let response = call(
            self.config.controller_addr.as_str(),
            &Request::RegisterWorker(registration),
            HEARTBEAT_CALL_TIMEOUT,
        )
        .await
        .map_err(|e| VajraError::Coordination(format!("registration failed: {e}")))?;

        match response {
            Response::Registration(reg) if reg.accepted => {
                *self
                    .intervals
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = StreamIntervals {
                    heartbeat_seconds: reg.heartbeat_interval_seconds.max(1),
                    metrics_seconds: reg.metrics_interval_seconds.max(1),
                };
                tracing::info!(worker_id = %self.config.worker_id, "registered with controller");
                Ok(reg)
            }
            Response::Registration(reg) => Err(VajraError::Coordination(format!(
                "registration rejected: {}",
                reg.message
            ))),
            other => Err(VajraError::Coordination(format!(
                "unexpected registration response: {other:?}"
            ))),
        }
    }

    /// Bind the RPC endpoint, register, then serve until the cancellation
    /// token fires. Spawns the accept loop, the heartbeat loop, and the
    /// metrics streamer. Binding happens first so the advertised port is
    /// live before the controller can dial back.
    pub async fn run(self: Arc<Self>) -> Result<(), VajraError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.rpc_port)).await?;
        let bound_port = listener.local_addr()?.port();
        tracing::info!(
            worker_id = %self.config.worker_id,
            port = bound_port,
            "worker RPC endpoint listening"
        );

        self.register_on_port(bound_port).await?;
        let intervals = *self
            .intervals
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let accept_runtime = Arc::clone(&self);
        let accept_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        tracing::debug!(%peer, "controller connection accepted");
                        let runtime = Arc::clone(&accept_runtime);
                        tokio::spawn(async move {
                            let mut connection = Connection::from_stream(stream);
                            while let Ok(Some(request)) = connection.read_request().await {
                                let response = runtime.handle_request(request).await;
                                if connection.send_response(&response).await.is_err() {
                                    return;
                                }
                            }
                        });
                    }
                    _ = accept_cancel.cancelled() => return,
                }
            }
        });

        let heartbeat_runtime = Arc::clone(&self);
        tokio::spawn(async move {
            heartbeat_runtime
                .heartbeat_loop(Duration::from_secs(u64::from(intervals.heartbeat_seconds)))
                .await;
        });

        let streamer = MetricsStreamer::new(
            self.config.controller_addr.clone(),
            self.config.worker_id.clone(),
            Arc::clone(&self.executor),
            Duration::from_secs(u64::from(intervals.metrics_seconds)),
            self.cancel.clone(),
        );
        tokio::spawn(streamer.run());

        self.cancel.cancelled().await;
        self.drain().await;
        Ok(())
    }

    /// Dispatch one controller request against the local executor.
    pub async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::AssignTask(assignment) => {
                Response::TaskAssignment(self.handle_assignment(assignment).await)
            }
            Request::StopTest(stop) => {
                let result = self.executor.stop(&stop.test_id, stop.graceful).await;
                Response::Stop(match result {
                    Ok(()) => StopResponse {
                        stopped: true,
                        message: format!("test {} stopping", stop.test_id),
                    },
                    Err(e) => StopResponse {
                        stopped: false,
                        message: e.to_string(),
                    },
                })
            }
            other => Response::Error {
                message: format!("worker does not serve this request: {other:?}"),
            },
        }
    }

    async fn handle_assignment(&self, assignment: TaskAssignment) -> TaskAssignmentResponse {
        let mut assignments = self.assignments.lock().await;
        if assignments.contains_key(&assignment.test_id) {
            return TaskAssignmentResponse {
                accepted: false,
                message: format!("test {} already assigned to this worker", assignment.test_id),
                error_code: AssignmentErrorCode::DuplicateAssignment,
            };
        }

        let config = assignment_to_config(&assignment);
        match self.executor.start(config, true).await {
            Ok(test_id) => {
                assignments.insert(test_id.clone(), assignment.target_tps);
                tracing::info!(%test_id, target_tps = assignment.target_tps, "assignment accepted");
                TaskAssignmentResponse {
                    accepted: true,
                    message: format!("test {test_id} started"),
                    error_code: AssignmentErrorCode::None,
                }
            }
            Err(e) => {
                let error_code = match &e {
                    VajraError::Resource(_) => AssignmentErrorCode::TooManyTests,
                    VajraError::Configuration(_) | VajraError::Validation(_) => {
                        AssignmentErrorCode::InvalidConfig
                    }
                    _ => AssignmentErrorCode::Internal,
                };
                tracing::warn!(test_id = %assignment.test_id, error = %e, "assignment rejected");
                TaskAssignmentResponse {
                    accepted: false,
                    message: e.to_string(),
                    error_code,
                }
            }
        }
    }

    /// Sum of assigned target TPS over tests that are still active.
    pub async fn current_load(&self) -> u32 {
        let assignments = self.assignments.lock().await;
        let mut load = 0u32;
        for (test_id, tps) in assignments.iter() {
            if let Ok(execution) = self.executor.status(test_id).await {
                if execution.status.is_active() {
                    load = load.saturating_add(*tps);
                }
            }
        }
        load
    }

    async fn heartbeat_loop(&self, period: Duration) {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => return,
            }
            let request = Request::Heartbeat(HeartbeatRequest {
                worker_id: self.config.worker_id.clone(),
                current_load: self.current_load().await,
                status: WorkerStatus::Healthy,
                timestamp_ms: Utc::now().timestamp_millis() as u64,
            });
            if let Err(e) = call(
                self.config.controller_addr.as_str(),
                &request,
                HEARTBEAT_CALL_TIMEOUT,
            )
            .await
            {
                tracing::warn!(error = %e, "heartbeat delivery failed");
            }
        }
    }

    /// Stop local tests gracefully and announce DRAINING before exit.
    async fn drain(&self) {
        tracing::info!(worker_id = %self.config.worker_id, "worker draining");
        for execution in self.executor.list().await {
            if execution.status.is_active() {
                let _ = self.executor.stop(&execution.test_id, true).await;
            }
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_BUDGET;
        while self.executor.running_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_DRAIN_POLL).await;
        }
        let farewell = Request::Heartbeat(HeartbeatRequest {
            worker_id: self.config.worker_id.clone(),
            current_load: 0,
            status: WorkerStatus::Draining,
            timestamp_ms: Utc::now().timestamp_millis() as u64,
        });
        let _ = call(
            self.config.controller_addr.as_str(),
            &farewell,
            HEARTBEAT_CALL_TIMEOUT,
        )
        .await;
    }
}

/// Translate a wire assignment into a local test config. A positive target
/// TPS engages the rate-limited mode so the local throttle enforces this
/// worker's share.
pub fn assignment_to_config(assignment: &TaskAssignment) -> TestConfig {
    let starting = assignment.ramp.starting_concurrency.max(1);
    let max = assignment.max_concurrency.max(starting);
    let (mode, max_tps) = if assignment.target_tps > 0 {
        (TestMode::RateLimited, Some(assignment.target_tps))
    } else {
        (TestMode::ConcurrencyBased, None)
    };
    let ramp_strategy = match assignment.ramp.kind {
        RampKind::Linear => RampStrategyKind::Linear,
        RampKind::Step => RampStrategyKind::Step,
    };

    TestConfig {
        test_id: assignment.test_id.clone(),
        mode,
        starting_concurrency: starting,
        max_concurrency: max,
        ramp_strategy,
        ramp_step: assignment.ramp.step.max(1),
        ramp_interval_seconds: assignment.ramp.interval_seconds.max(1),
        ramp_duration_seconds: assignment.ramp.duration_seconds.max(1),
        test_duration_seconds: assignment.duration_seconds,
        max_tps_limit: max_tps,
        task_type: assignment.task_type.clone(),
        task_parameters: assignment.parameters.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
