use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::config::TestConfig;

pub mod checks;

pub use checks::{ConfigurationCheck, NetworkCheck, ResourceCheck, ServiceHealthCheck};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Outcome of a single pre-flight check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl CheckStatus {
    fn severity(self) -> u8 {
        match self {
            CheckStatus::Fail => 3,
            CheckStatus::Warn => 2,
            CheckStatus::Pass => 1,
            CheckStatus::Skip => 0,
        }
    }
}

/// Detailed result of one check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            details: Vec::new(),
            metadata: HashMap::new(),
            duration_ms: 0,
        }
    }

    pub fn pass(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    pub fn warn(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    pub fn fail(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    pub fn skip(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Skip, message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Aggregated outcome of a validation run. `status` is the worst individual
/// check status (FAIL > WARN > PASS); SKIP never degrades the overall result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ValidationResult {
    pub status: CheckStatus,
    pub checks: Vec<CheckResult>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    /// Human-readable list of every WARN/FAIL check with its details,
    /// suitable for error messages.
    pub fn describe_failures(&self) -> String {
        let parts: Vec<String> = self
            .checks
            .iter()
            .filter(|c| matches!(c.status, CheckStatus::Fail | CheckStatus::Warn))
            .map(|c| {
                if c.details.is_empty() {
                    format!("{}: {}", c.name, c.message)
                } else {
                    format!("{}: {} ({})", c.name, c.message, c.details.join("; "))
                }
            })
            .collect();
        if parts.is_empty() {
            "no failing checks".to_string()
        } else {
            parts.join("; ")
        }
    }
}

// ---------------------------------------------------------------------------
// Check trait and validator
// ---------------------------------------------------------------------------

/// A single pre-flight check. Implementations bound their own I/O with
/// internal timeouts so the validator never hangs.
#[async_trait]
pub trait PreflightCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, config: &TestConfig) -> CheckResult;
}

/// Runs a fixed, ordered set of checks in parallel and folds their outcomes.
///
/// Built-in checks always occupy the head of the list in registration order;
/// checks registered later append after them and cannot reorder built-ins.
pub struct PreflightValidator {
    checks: Vec<Arc<dyn PreflightCheck>>,
}

impl PreflightValidator {
    /// A validator with no checks (every config passes).
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// The four built-in checks in their canonical order.
    pub fn with_builtin_checks() -> Self {
        let mut validator = Self::new();
        validator.register(Arc::new(ServiceHealthCheck::new()));
        validator.register(Arc::new(ConfigurationCheck));
        validator.register(Arc::new(ResourceCheck::default()));
        validator.register(Arc::new(NetworkCheck));
        validator
    }

    pub fn register(&mut self, check: Arc<dyn PreflightCheck>) {
        self.checks.push(check);
    }

    /// Execute every check concurrently and aggregate the results, preserving
    /// registration order in the output.
    pub async fn validate(&self, config: &TestConfig) -> ValidationResult {
        let mut join_set: JoinSet<(usize, CheckResult)> = JoinSet::new();
        for (index, check) in self.checks.iter().enumerate() {
            let check = Arc::clone(check);
            let config = config.clone();
            join_set.spawn(async move {
                let start = Instant::now();
                let mut result = check.run(&config).await;
                result.duration_ms = start.elapsed().as_millis() as u64;
                (index, result)
            });
        }

        let mut results: Vec<(usize, CheckResult)> = Vec::with_capacity(self.checks.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => {
                    tracing::error!("pre-flight check task failed: {e}");
                }
            }
        }
        results.sort_by_key(|(index, _)| *index);
        let checks: Vec<CheckResult> = results.into_iter().map(|(_, r)| r).collect();

        let status = checks
            .iter()
            .map(|c| c.status)
            .filter(|s| *s != CheckStatus::Skip)
            .max_by_key(|s| s.severity())
            .unwrap_or(CheckStatus::Pass);

        ValidationResult {
            status,
            checks,
            timestamp: Utc::now(),
        }
    }
}

impl Default for PreflightValidator {
    fn default() -> Self {
        Self::with_builtin_checks()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCheck {
        name: &'static str,
        status: CheckStatus,
    }

    #[async_trait]
    impl PreflightCheck for FixedCheck {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _config: &TestConfig) -> CheckResult {
            CheckResult::new(self.name, self.status, "fixed")
        }
    }

    fn config() -> TestConfig {
        TestConfig::new("preflight-test", "SLEEP")
    }

    #[tokio::test]
    async fn empty_validator_passes() {
        let validator = PreflightValidator::new();
        let result = validator.validate(&config()).await;
        assert_eq!(result.status, CheckStatus::Pass);
        assert!(result.checks.is_empty());
    }

    #[tokio::test]
    async fn overall_status_is_worst_check() {
        let mut validator = PreflightValidator::new();
        validator.register(Arc::new(FixedCheck {
            name: "a",
            status: CheckStatus::Pass,
        }));
        validator.register(Arc::new(FixedCheck {
            name: "b",
            status: CheckStatus::Warn,
        }));
        let result = validator.validate(&config()).await;
        assert_eq!(result.status, CheckStatus::Warn);

        validator.register(Arc::new(FixedCheck {
            name: "c",
            status: CheckStatus::Fail,
        }));
        let result = validator.validate(&config()).await;
        assert_eq!(result.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn skip_does_not_degrade_overall_status() {
        let mut validator = PreflightValidator::new();
        validator.register(Arc::new(FixedCheck {
            name: "a",
            status: CheckStatus::Pass,
        }));
        validator.register(Arc::new(FixedCheck {
            name: "b",
            status: CheckStatus::Skip,
        }));
        let result = validator.validate(&config()).await;
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn results_preserve_registration_order() {
        let mut validator = PreflightValidator::new();
        for name in ["first", "second", "third"] {
            validator.register(Arc::new(FixedCheck {
                name,
                status: CheckStatus::Pass,
            }));
        }
        let result = validator.validate(&config()).await;
        let names: Vec<&str> = result.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn validation_is_structurally_idempotent() {
        let validator = PreflightValidator::with_builtin_checks();
        let first = validator.validate(&config()).await;
        let second = validator.validate(&config()).await;
        let first_names: Vec<&str> = first.checks.iter().map(|c| c.name.as_str()).collect();
        let second_names: Vec<&str> = second.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(first_names, second_names);
    }

    #[test]
    fn describe_failures_includes_details() {
        let result = ValidationResult {
            status: CheckStatus::Fail,
            checks: vec![
                CheckResult::pass("ok", "fine"),
                CheckResult::fail("ConfigurationCheck", "invalid configuration")
                    .with_detail("concurrency exceeds limit 50000"),
            ],
            timestamp: Utc::now(),
        };
        let described = result.describe_failures();
        assert!(described.contains("ConfigurationCheck"));
        assert!(described.contains("concurrency exceeds limit 50000"));
        assert!(!described.contains("ok"));
    }

    #[test]
    fn check_result_builders() {
        let result = CheckResult::warn("ResourceCheck", "low memory")
            .with_detail("only 300 MB free")
            .with_metadata("available_mb", "300");
        assert_eq!(result.status, CheckStatus::Warn);
        assert_eq!(result.details.len(), 1);
        assert_eq!(result.metadata.get("available_mb").map(String::as_str), Some("300"));
    }
}
