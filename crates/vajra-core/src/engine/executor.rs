use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::TestConfig;
use crate::engine::controller::ConcurrencyController;
use crate::engine::virtual_user::VirtualUserManager;
use crate::engine::TestStatus;
use crate::error::VajraError;
use crate::metrics::{LatencyStats, MetricsCollector, MetricsSnapshot};
use crate::preflight::{CheckStatus, PreflightValidator, ValidationResult};
use crate::task::{TaskFactory, TaskRegistry};

/// Hard cap on concurrently running tests per executor process.
pub const MAX_CONCURRENT_TESTS: usize = 10;

/// Control-loop tick.
const CONTROL_TICK: Duration = Duration::from_millis(100);

/// Budget for draining in-flight tasks on a graceful stop.
const DRAIN_BUDGET: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// Point-in-time view of one test's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestExecution {
    pub test_id: String,
    pub status: TestStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub config: TestConfig,
}

/// Aggregated summary of a test, computable at any point of its life.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestSummary {
    pub test_id: String,
    pub status: TestStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub latency: LatencyStats,
    /// Tasks per second averaged over the whole run.
    pub average_tps: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub error_counts: HashMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Internal per-test state
// ---------------------------------------------------------------------------

struct TestHandle {
    config: TestConfig,
    status: std::sync::RwLock<TestStatus>,
    metrics: Arc<MetricsCollector>,
    /// User-initiated stop signal.
    cancel: CancellationToken,
    graceful: AtomicBool,
    started_at: DateTime<Utc>,
    completed_at: std::sync::RwLock<Option<DateTime<Utc>>>,
    failure_reason: std::sync::RwLock<Option<String>>,
}

impl TestHandle {
    fn status(&self) -> TestStatus {
        *self
            .status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `next` unless the test already reached a terminal state.
    fn set_status(&self, next: TestStatus) {
        let mut status = self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !status.is_terminal() {
            *status = next;
        }
    }

    /// Phase updates only apply while the test is actively executing, so a
    /// racing STOPPING transition is never overwritten.
    fn advance_phase(&self, phase: TestStatus) {
        let mut status = self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(
            *status,
            TestStatus::Running | TestStatus::Ramping | TestStatus::Sustaining
        ) {
            *status = phase;
        }
    }

    fn finish(&self, terminal: TestStatus) {
        self.set_status(terminal);
        let mut completed = self
            .completed_at
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if completed.is_none() {
            *completed = Some(Utc::now());
        }
    }

    fn fail(&self, reason: &str) {
        {
            let mut failure = self
                .failure_reason
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if failure.is_none() {
                *failure = Some(reason.to_string());
            }
        }
        self.finish(TestStatus::Failed);
    }

    fn execution(&self) -> TestExecution {
        TestExecution {
            test_id: self.config.test_id.clone(),
            status: self.status(),
            started_at: self.started_at,
            completed_at: *self
                .completed_at
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            failure_reason: self
                .failure_reason
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            config: self.config.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Owns every local test: starts them, drives their control loops, and
/// answers status/metrics queries. Completed tests stay queryable until the
/// process exits (results are session-scoped, never persisted).
pub struct TestExecutor {
    registry: Arc<TaskRegistry>,
    validator: Arc<PreflightValidator>,
    tests: RwLock<HashMap<String, Arc<TestHandle>>>,
}

impl TestExecutor {
    pub fn new(registry: Arc<TaskRegistry>, validator: Arc<PreflightValidator>) -> Self {
        Self {
            registry,
            validator,
            tests: RwLock::new(HashMap::new()),
        }
    }

    /// Start a test whose factory is resolved from the task registry.
    pub async fn start(
        &self,
        config: TestConfig,
        validation_override: bool,
    ) -> Result<String, VajraError> {
        let factory = self
            .registry
            .create_factory(&config.task_type, &config.task_parameters)?;
        self.start_with_factory(config, factory, validation_override)
            .await
    }

    /// Start a test with an explicitly supplied factory (used by suites to
    /// inject task-mix factories).
    pub async fn start_with_factory(
        &self,
        config: TestConfig,
        factory: Arc<dyn TaskFactory>,
        validation_override: bool,
    ) -> Result<String, VajraError> {
        // Pre-flight covers the numeric limit table plus environment checks.
        // FAIL always blocks; WARN blocks unless the caller overrides.
        let validation = self.validator.validate(&config).await;
        match validation.status {
            CheckStatus::Fail => {
                return Err(VajraError::Validation(validation.describe_failures()));
            }
            CheckStatus::Warn if !validation_override => {
                return Err(VajraError::Validation(validation.describe_failures()));
            }
            _ => {}
        }

        let controller = ConcurrencyController::from_config(&config)?;
        let test_id = config.test_id.clone();

        let handle = {
            let mut tests = self.tests.write().await;
            if tests.contains_key(&test_id) {
                return Err(VajraError::Lifecycle(format!(
                    "test {test_id} already exists"
                )));
            }
            let running = tests.values().filter(|h| h.status().is_active()).count();
            if running >= MAX_CONCURRENT_TESTS {
                return Err(VajraError::Resource(format!(
                    "too many concurrent tests (limit {MAX_CONCURRENT_TESTS})"
                )));
            }

            // Validation already passed, so the test is born RUNNING; the
            // PENDING state only exists between acceptance and validation.
            let handle = Arc::new(TestHandle {
                config: config.clone(),
                status: std::sync::RwLock::new(TestStatus::Running),
                metrics: Arc::new(MetricsCollector::new()),
                cancel: CancellationToken::new(),
                graceful: AtomicBool::new(true),
                started_at: Utc::now(),
                completed_at: std::sync::RwLock::new(None),
                failure_reason: std::sync::RwLock::new(None),
            });
            tests.insert(test_id.clone(), Arc::clone(&handle));
            handle
        };

        let manager = VirtualUserManager::new(factory, Arc::clone(&handle.metrics));
        let loop_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let run = run_control_loop(Arc::clone(&loop_handle), manager, controller);
            if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                tracing::error!(test_id = %loop_handle.config.test_id, "control loop panicked");
                loop_handle.fail("internal control loop failure");
            }
        });

        tracing::info!(%test_id, "test started");
        Ok(test_id)
    }

    pub async fn status(&self, test_id: &str) -> Result<TestExecution, VajraError> {
        let tests = self.tests.read().await;
        tests
            .get(test_id)
            .map(|h| h.execution())
            .ok_or_else(|| VajraError::NotFound(test_id.to_string()))
    }

    pub async fn metrics(&self, test_id: &str) -> Result<MetricsSnapshot, VajraError> {
        let tests = self.tests.read().await;
        tests
            .get(test_id)
            .map(|h| h.metrics.snapshot())
            .ok_or_else(|| VajraError::NotFound(test_id.to_string()))
    }

    /// Request a stop. Graceful stops honour the 5 s drain budget; forced
    /// stops abort in-flight users immediately.
    pub async fn stop(&self, test_id: &str, graceful: bool) -> Result<(), VajraError> {
        let handle = {
            let tests = self.tests.read().await;
            tests
                .get(test_id)
                .cloned()
                .ok_or_else(|| VajraError::NotFound(test_id.to_string()))?
        };
        if !handle.status().is_active() {
            return Err(VajraError::Lifecycle(format!(
                "test {test_id} is not running"
            )));
        }
        handle.graceful.store(graceful, Ordering::Relaxed);
        handle.cancel.cancel();
        tracing::info!(%test_id, graceful, "stop requested");
        Ok(())
    }

    pub async fn list(&self) -> Vec<TestExecution> {
        let tests = self.tests.read().await;
        let mut executions: Vec<TestExecution> = tests.values().map(|h| h.execution()).collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        executions
    }

    pub async fn summary(&self, test_id: &str) -> Result<TestSummary, VajraError> {
        let handle = {
            let tests = self.tests.read().await;
            tests
                .get(test_id)
                .cloned()
                .ok_or_else(|| VajraError::NotFound(test_id.to_string()))?
        };
        let snapshot = handle.metrics.snapshot();
        let finished_at = *handle
            .completed_at
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed_secs = finished_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(handle.started_at)
            .num_milliseconds() as f64
            / 1000.0;
        let average_tps = if elapsed_secs > 0.0 {
            snapshot.total_tasks as f64 / elapsed_secs
        } else {
            0.0
        };
        Ok(TestSummary {
            test_id: test_id.to_string(),
            status: handle.status(),
            started_at: handle.started_at,
            finished_at,
            total_tasks: snapshot.total_tasks,
            successful_tasks: snapshot.successful_tasks,
            failed_tasks: snapshot.failed_tasks,
            latency: snapshot.latency,
            average_tps,
            error_counts: snapshot.error_counts,
        })
    }

    /// Run pre-flight validation without starting anything.
    pub async fn validate(&self, config: &TestConfig) -> ValidationResult {
        self.validator.validate(config).await
    }

    /// Number of tests currently holding virtual users.
    pub async fn running_count(&self) -> usize {
        let tests = self.tests.read().await;
        tests.values().filter(|h| h.status().is_active()).count()
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

enum StopCause {
    DurationReached,
    UserRequested,
}

/// Drives one test: every 100 ms recompute the concurrency target, apply it,
/// refresh the throttle flag, and publish the RAMPING/SUSTAINING phase. On
/// exit (duration reached or stop requested) the virtual users are drained
/// and the terminal status resolved.
async fn run_control_loop(
    handle: Arc<TestHandle>,
    mut manager: VirtualUserManager,
    controller: ConcurrencyController,
) {
    handle.set_status(TestStatus::Running);

    let started = Instant::now();
    let duration = Duration::from_secs(handle.config.test_duration_seconds);
    let ramp_end = handle.config.ramp_end_seconds() as f64;

    let mut ticker = interval(CONTROL_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let cause = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = handle.cancel.cancelled() => break StopCause::UserRequested,
        }

        let elapsed = started.elapsed();
        if elapsed >= duration {
            break StopCause::DurationReached;
        }
        let secs = elapsed.as_secs_f64();

        manager.set_target_count(controller.target_concurrency(secs));
        manager.set_throttled(controller.should_throttle(handle.metrics.current_tps()));

        let phase = if secs < ramp_end {
            TestStatus::Ramping
        } else {
            TestStatus::Sustaining
        };
        handle.advance_phase(phase);
    };

    handle.set_status(TestStatus::Stopping);
    let budget = if handle.graceful.load(Ordering::Relaxed) {
        DRAIN_BUDGET
    } else {
        Duration::ZERO
    };
    let drained = manager.shutdown(budget).await;

    // A clean run that exhausted its duration completes; a user-initiated or
    // forced stop lands on STOPPED.
    let terminal = match cause {
        StopCause::DurationReached if drained => TestStatus::Completed,
        _ => TestStatus::Stopped,
    };
    handle.finish(terminal);
    tracing::info!(
        test_id = %handle.config.test_id,
        status = %terminal,
        drained,
        "test finished"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
