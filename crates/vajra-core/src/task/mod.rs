use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::VajraError;

pub mod http;
pub mod sleep;

pub use http::HttpTaskFactory;
pub use sleep::{CpuTaskFactory, SleepTaskFactory};

// ---------------------------------------------------------------------------
// Task SPI
// ---------------------------------------------------------------------------

/// Payload returned by a successful task invocation.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    /// Bytes processed by the invocation (response body size for HTTP).
    pub bytes_processed: u64,
}

/// Error raised by a task invocation.
///
/// Variants map to the stable error-kind strings used for aggregation; the
/// engine never inspects anything beyond [`TaskError::kind`].
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("request timed out")]
    Timeout,

    #[error("connection refused")]
    Refused,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{0}")]
    Other(String),
}

impl TaskError {
    /// Small-cardinality categorical name used as the snapshot error kind.
    pub fn kind(&self) -> String {
        match self {
            TaskError::Timeout => "timeout".to_string(),
            TaskError::Refused => "refused".to_string(),
            TaskError::Status(code) => format!("http-{}xx", code / 100),
            TaskError::InvalidResponse(_) => "invalid-response".to_string(),
            TaskError::InvalidParameter(_) => "invalid-parameter".to_string(),
            TaskError::Other(_) => "unknown".to_string(),
        }
    }
}

/// A single unit of work. Constructed per invocation, executed once, dropped.
///
/// Implementations must be safe to execute from many virtual users
/// concurrently; any shared state (HTTP connection pools etc.) lives in the
/// owning [`TaskFactory`].
#[async_trait]
pub trait Task: Send + Sync {
    async fn execute(&self) -> Result<TaskOutput, TaskError>;
}

/// Creates [`Task`] values for one test. Built once from the validated
/// parameter bag; `create_task` is called once per invocation and must be
/// cheap.
pub trait TaskFactory: Send + Sync {
    fn task_type(&self) -> &str;
    fn create_task(&self) -> Box<dyn Task>;
}

impl std::fmt::Debug for dyn TaskFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFactory")
            .field("task_type", &self.task_type())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Outcome record
// ---------------------------------------------------------------------------

/// Immutable record of one completed task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskResult {
    pub task_id: u64,
    pub success: bool,
    pub latency_nanos: u64,
    /// Present exactly when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub bytes_processed: u64,
}

impl TaskResult {
    pub fn success(task_id: u64, latency_nanos: u64, bytes_processed: u64) -> Self {
        Self {
            task_id,
            success: true,
            latency_nanos,
            error_kind: None,
            bytes_processed,
        }
    }

    pub fn failure(task_id: u64, latency_nanos: u64, error_kind: String) -> Self {
        Self {
            task_id,
            success: false,
            latency_nanos,
            error_kind: Some(error_kind),
            bytes_processed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type TaskConstructor =
    dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn TaskFactory>, VajraError> + Send + Sync;

/// Maps task-type names to factory constructors.
///
/// Names are case-insensitive and canonicalised to upper-case. Registration
/// is one-shot at startup; after that the registry is shared read-only behind
/// an `Arc`.
pub struct TaskRegistry {
    constructors: HashMap<String, Arc<TaskConstructor>>,
}

impl TaskRegistry {
    /// An empty registry with no task types.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// A registry pre-populated with the built-in task types:
    /// `HTTP_GET`, `HTTP_POST`, `HTTP`, `SLEEP`, `CPU`.
    pub fn with_builtin_tasks() -> Self {
        let mut registry = Self::new();
        for name in ["HTTP_GET", "HTTP_POST", "HTTP"] {
            registry
                .register(name, move |params| {
                    let factory: Arc<dyn TaskFactory> =
                        Arc::new(HttpTaskFactory::from_parameters(name, params)?);
                    Ok(factory)
                })
                .expect("empty registry cannot hold a builtin twice");
        }
        registry
            .register("SLEEP", |params| {
                let factory: Arc<dyn TaskFactory> =
                    Arc::new(SleepTaskFactory::from_parameters(params)?);
                Ok(factory)
            })
            .expect("empty registry cannot hold SLEEP");
        registry
            .register("CPU", |params| {
                let factory: Arc<dyn TaskFactory> =
                    Arc::new(CpuTaskFactory::from_parameters(params)?);
                Ok(factory)
            })
            .expect("empty registry cannot hold CPU");
        registry
    }

    /// Register a constructor under `name`. Duplicate names fail fast.
    pub fn register<F>(&mut self, name: &str, constructor: F) -> Result<(), VajraError>
    where
        F: Fn(&HashMap<String, String>) -> Result<Arc<dyn TaskFactory>, VajraError>
            + Send
            + Sync
            + 'static,
    {
        let canonical = canonical_name(name);
        if canonical.is_empty() {
            return Err(VajraError::Configuration(
                "task type name must not be empty".to_string(),
            ));
        }
        if self.constructors.contains_key(&canonical) {
            return Err(VajraError::DuplicateRegistration(canonical));
        }
        self.constructors.insert(canonical, Arc::new(constructor));
        Ok(())
    }

    /// Construct a factory for `task_type`, validating `params` in the
    /// process.
    pub fn create_factory(
        &self,
        task_type: &str,
        params: &HashMap<String, String>,
    ) -> Result<Arc<dyn TaskFactory>, VajraError> {
        let canonical = canonical_name(task_type);
        let constructor = self.constructors.get(&canonical).ok_or_else(|| {
            VajraError::Configuration(format!("unknown task type: {canonical}"))
        })?;
        constructor(params)
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.constructors.contains_key(&canonical_name(task_type))
    }

    /// All registered type names, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_builtin_tasks()
    }
}

fn canonical_name(name: &str) -> String {
    name.trim().to_uppercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
