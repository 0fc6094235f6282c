use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::TestConfig;
use crate::engine::{TestExecutor, TestStatus};
use crate::error::VajraError;
use crate::metrics::MetricsSnapshot;
use crate::task::{Task, TaskFactory, TaskRegistry};

pub mod correlation;

pub use correlation::CorrelationContext;

/// How often a scenario's status is polled while it runs.
const SCENARIO_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Task mix
// ---------------------------------------------------------------------------

/// Weighted selection of task types, sampled once per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMix {
    /// (task type, weight), sorted by type name for deterministic layout.
    entries: Vec<(String, u32)>,
    total_weight: u64,
}

impl TaskMix {
    /// Build a mix; every weight must be positive and the mix non-empty.
    pub fn new(weights: HashMap<String, u32>) -> Result<Self, VajraError> {
        if weights.is_empty() {
            return Err(VajraError::Configuration(
                "task mix must contain at least one task type".to_string(),
            ));
        }
        let mut entries: Vec<(String, u32)> = Vec::with_capacity(weights.len());
        for (task_type, weight) in weights {
            if weight == 0 {
                return Err(VajraError::Configuration(format!(
                    "task mix weight for {task_type} must be positive"
                )));
            }
            entries.push((task_type.trim().to_uppercase(), weight));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let total_weight = entries.iter().map(|(_, w)| u64::from(*w)).sum();
        Ok(Self {
            entries,
            total_weight,
        })
    }

    /// Pick a task type with probability proportional to its weight.
    pub fn select(&self) -> &str {
        let mut remaining = rand::thread_rng().gen_range(0..self.total_weight);
        for (task_type, weight) in &self.entries {
            let weight = u64::from(*weight);
            if remaining < weight {
                return task_type;
            }
            remaining -= weight;
        }
        // Unreachable for a well-formed mix; fall back to the last entry.
        &self.entries[self.entries.len() - 1].0
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(t, _)| t.as_str())
    }
}

/// Factory that resolves the concrete task type per invocation via a mix.
struct MixedTaskFactory {
    mix: TaskMix,
    factories: HashMap<String, Arc<dyn TaskFactory>>,
}

impl MixedTaskFactory {
    fn from_registry(
        registry: &TaskRegistry,
        mix: TaskMix,
        params: &HashMap<String, String>,
    ) -> Result<Self, VajraError> {
        let mut factories = HashMap::new();
        for task_type in mix.task_types() {
            let factory = registry.create_factory(task_type, params)?;
            factories.insert(task_type.to_string(), factory);
        }
        Ok(Self { mix, factories })
    }
}

impl TaskFactory for MixedTaskFactory {
    fn task_type(&self) -> &str {
        "MIX"
    }

    fn create_task(&self) -> Box<dyn Task> {
        let task_type = self.mix.select();
        self.factories[task_type].create_task()
    }
}

// ---------------------------------------------------------------------------
// Suite model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuiteExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// One test configuration plus an optional task mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestScenario {
    pub scenario_id: String,
    pub name: String,
    pub config: TestConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_mix: Option<TaskMix>,
}

/// An ordered or parallel collection of scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestSuite {
    pub suite_id: String,
    pub name: String,
    #[serde(default)]
    pub execution_mode: SuiteExecutionMode,
    #[serde(default)]
    pub use_correlation: bool,
    /// Abort a sequential run at the first failing scenario.
    #[serde(default)]
    pub fail_fast: bool,
    pub scenarios: Vec<TestScenario>,
}

impl TestSuite {
    pub fn validate(&self) -> Result<(), VajraError> {
        if self.scenarios.is_empty() {
            return Err(VajraError::Configuration(
                "suite must contain at least one scenario".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            if !seen.insert(scenario.scenario_id.as_str()) {
                return Err(VajraError::Configuration(format!(
                    "duplicate scenario id: {}",
                    scenario.scenario_id
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one scenario within a suite run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScenarioResult {
    pub scenario_id: String,
    pub name: String,
    /// The synthesised per-run test id the scenario executed under.
    pub test_id: String,
    pub status: TestStatus,
    pub metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Outcome of a whole suite run; `status` is the worst scenario status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SuiteResult {
    pub suite_id: String,
    pub name: String,
    pub status: TestStatus,
    pub scenarios: Vec<ScenarioResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Suite executor
// ---------------------------------------------------------------------------

/// Orchestrates multi-scenario runs on top of the single-test executor.
///
/// The test executor's global concurrency cap applies transitively: a
/// parallel suite that would exceed it sees its excess scenarios fail with a
/// resource error.
pub struct SuiteExecutor {
    executor: Arc<TestExecutor>,
    registry: Arc<TaskRegistry>,
}

impl SuiteExecutor {
    pub fn new(executor: Arc<TestExecutor>, registry: Arc<TaskRegistry>) -> Self {
        Self { executor, registry }
    }

    pub async fn run(
        &self,
        suite: TestSuite,
        validation_override: bool,
    ) -> Result<SuiteResult, VajraError> {
        suite.validate()?;

        // One fresh context per run, shared by every scenario in it.
        let correlation = suite
            .use_correlation
            .then(|| Arc::new(CorrelationContext::new()));
        let started_at = Utc::now();
        tracing::info!(suite_id = %suite.suite_id, mode = ?suite.execution_mode, "suite started");

        let results = match suite.execution_mode {
            SuiteExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(suite.scenarios.len());
                for scenario in &suite.scenarios {
                    let result = run_scenario(
                        Arc::clone(&self.executor),
                        Arc::clone(&self.registry),
                        scenario.clone(),
                        validation_override,
                    )
                    .await;
                    let failed = result.status == TestStatus::Failed;
                    results.push(result);
                    if failed && suite.fail_fast {
                        tracing::warn!(suite_id = %suite.suite_id, "fail-fast abort");
                        break;
                    }
                }
                results
            }
            SuiteExecutionMode::Parallel => {
                let mut join_set: JoinSet<(usize, ScenarioResult)> = JoinSet::new();
                for (index, scenario) in suite.scenarios.iter().enumerate() {
                    let executor = Arc::clone(&self.executor);
                    let registry = Arc::clone(&self.registry);
                    let scenario = scenario.clone();
                    join_set.spawn(async move {
                        let result =
                            run_scenario(executor, registry, scenario, validation_override).await;
                        (index, result)
                    });
                }
                let mut indexed = Vec::with_capacity(suite.scenarios.len());
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok(entry) => indexed.push(entry),
                        Err(e) => tracing::error!("scenario task failed: {e}"),
                    }
                }
                indexed.sort_by_key(|(index, _)| *index);
                indexed.into_iter().map(|(_, r)| r).collect()
            }
        };

        // Keep the context alive until every scenario has finished.
        drop(correlation);

        let status = results
            .iter()
            .map(|r| r.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(TestStatus::Completed);

        Ok(SuiteResult {
            suite_id: suite.suite_id,
            name: suite.name,
            status,
            scenarios: results,
            started_at,
            completed_at: Utc::now(),
        })
    }
}

/// Run one scenario to a terminal state and capture its outcome. Scenario
/// failures are folded into the result, never propagated — whether they stop
/// the suite is the caller's fail-fast decision.
async fn run_scenario(
    executor: Arc<TestExecutor>,
    registry: Arc<TaskRegistry>,
    scenario: TestScenario,
    validation_override: bool,
) -> ScenarioResult {
    let started_at = Utc::now();

    // Re-runs of the same suite must not collide with retained test ids.
    let mut config = scenario.config.clone();
    config.test_id = format!("{}-{}", scenario.scenario_id, Uuid::new_v4());
    let test_id = config.test_id.clone();

    let start_outcome = match &scenario.task_mix {
        Some(mix) => MixedTaskFactory::from_registry(&registry, mix.clone(), &config.task_parameters)
            .map(|factory| Arc::new(factory) as Arc<dyn TaskFactory>)
            .map(|factory| (config.clone(), factory)),
        None => registry
            .create_factory(&config.task_type, &config.task_parameters)
            .map(|factory| (config.clone(), factory)),
    };

    let started = match start_outcome {
        Ok((config, factory)) => {
            executor
                .start_with_factory(config, factory, validation_override)
                .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = started {
        tracing::warn!(scenario_id = %scenario.scenario_id, error = %e, "scenario failed to start");
        return ScenarioResult {
            scenario_id: scenario.scenario_id,
            name: scenario.name,
            test_id,
            status: TestStatus::Failed,
            metrics: MetricsSnapshot::empty(),
            failure_reason: Some(e.to_string()),
            started_at,
            completed_at: Utc::now(),
        };
    }

    // Poll until the underlying test reaches a terminal state.
    let final_status = loop {
        match executor.status(&test_id).await {
            Ok(execution) if execution.status.is_terminal() => break execution,
            Ok(_) => tokio::time::sleep(SCENARIO_POLL_INTERVAL).await,
            Err(e) => {
                return ScenarioResult {
                    scenario_id: scenario.scenario_id,
                    name: scenario.name,
                    test_id,
                    status: TestStatus::Failed,
                    metrics: MetricsSnapshot::empty(),
                    failure_reason: Some(e.to_string()),
                    started_at,
                    completed_at: Utc::now(),
                };
            }
        }
    };

    let metrics = executor
        .metrics(&test_id)
        .await
        .unwrap_or_else(|_| MetricsSnapshot::empty());

    ScenarioResult {
        scenario_id: scenario.scenario_id,
        name: scenario.name,
        test_id,
        status: final_status.status,
        metrics,
        failure_reason: final_status.failure_reason,
        started_at,
        completed_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
