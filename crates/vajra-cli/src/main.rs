use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use vajra_core::config::TestConfig;
use vajra_core::engine::TestExecutor;
use vajra_core::error::VajraError;
use vajra_core::preflight::PreflightValidator;
use vajra_core::suite::{SuiteExecutor, TestSuite};
use vajra_core::task::TaskRegistry;

/// How often progress is reported while a test runs.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Headless VajraEdge load testing.
#[derive(Parser, Debug)]
#[command(name = "vajra-cli", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single test described by a JSON config file.
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Proceed despite pre-flight warnings.
        #[arg(long)]
        override_validation: bool,
    },
    /// Run pre-flight validation and print the result.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run a multi-scenario suite described by a JSON file.
    Suite {
        #[arg(long)]
        config: PathBuf,
        /// Proceed despite pre-flight warnings.
        #[arg(long)]
        override_validation: bool,
    },
}

fn load_test_config(path: &Path) -> Result<TestConfig, VajraError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn load_suite(path: &Path) -> Result<TestSuite, VajraError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn build_executor() -> (Arc<TestExecutor>, Arc<TaskRegistry>) {
    let registry = Arc::new(TaskRegistry::with_builtin_tasks());
    let executor = Arc::new(TestExecutor::new(
        Arc::clone(&registry),
        Arc::new(PreflightValidator::with_builtin_checks()),
    ));
    (executor, registry)
}

async fn run_single(config: TestConfig, override_validation: bool) -> Result<(), VajraError> {
    let (executor, _registry) = build_executor();
    let test_id = executor.start(config, override_validation).await?;
    tracing::info!(%test_id, "test started");

    let stop_executor = Arc::clone(&executor);
    let stop_id = test_id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping test");
            let _ = stop_executor.stop(&stop_id, true).await;
        }
    });

    loop {
        tokio::time::sleep(PROGRESS_INTERVAL).await;
        let execution = executor.status(&test_id).await?;
        let snapshot = executor.metrics(&test_id).await?;
        tracing::info!(
            status = %execution.status,
            total = snapshot.total_tasks,
            active = snapshot.active_tasks,
            tps = snapshot.current_tps,
            p95_ms = snapshot.latency.p95_ms,
            error_rate = snapshot.error_rate,
            "progress"
        );
        if execution.status.is_terminal() {
            break;
        }
    }

    let summary = executor.summary(&test_id).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_validate(config: TestConfig) -> Result<(), VajraError> {
    let validator = PreflightValidator::with_builtin_checks();
    let result = validator.validate(&config).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_suite(suite: TestSuite, override_validation: bool) -> Result<(), VajraError> {
    let (executor, registry) = build_executor();
    let suite_executor = SuiteExecutor::new(executor, registry);
    let result = suite_executor.run(suite, override_validation).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            override_validation,
        } => run_single(load_test_config(&config)?, override_validation).await?,
        Command::Validate { config } => run_validate(load_test_config(&config)?).await?,
        Command::Suite {
            config,
            override_validation,
        } => run_suite(load_suite(&config)?, override_validation).await?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(json.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn load_test_config_parses_json() {
        let file = write_config(
            r#"{
                "test_id": "cli-1",
                "mode": "CONCURRENCY_BASED",
                "starting_concurrency": 1,
                "max_concurrency": 2,
                "ramp_strategy": "LINEAR",
                "ramp_duration_seconds": 1,
                "test_duration_seconds": 5,
                "task_type": "SLEEP",
                "task_parameters": { "duration": "10" }
            }"#,
        );
        let config = load_test_config(file.path()).expect("parse config");
        assert_eq!(config.test_id, "cli-1");
        assert_eq!(config.max_concurrency, 2);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn load_test_config_missing_file_errors() {
        let err = load_test_config(Path::new("/definitely/not/here.json"))
            .expect_err("missing file must fail");
        assert!(matches!(err, VajraError::Io(_)));
    }

    #[test]
    fn load_test_config_malformed_json_errors() {
        let file = write_config("{ not json");
        let err = load_test_config(file.path()).expect_err("malformed json must fail");
        assert!(matches!(err, VajraError::Serde(_)));
    }

    #[test]
    fn load_suite_parses_scenarios() {
        let file = write_config(
            r#"{
                "suite_id": "suite-1",
                "name": "smoke",
                "execution_mode": "SEQUENTIAL",
                "use_correlation": false,
                "fail_fast": true,
                "scenarios": [
                    {
                        "scenario_id": "s1",
                        "name": "first",
                        "config": {
                            "test_id": "t1",
                            "starting_concurrency": 1,
                            "max_concurrency": 1,
                            "ramp_duration_seconds": 1,
                            "test_duration_seconds": 1,
                            "task_type": "SLEEP",
                            "task_parameters": { "duration": "5" }
                        }
                    }
                ]
            }"#,
        );
        let suite = load_suite(file.path()).expect("parse suite");
        assert_eq!(suite.suite_id, "suite-1");
        assert_eq!(suite.scenarios.len(), 1);
        assert!(suite.fail_fast);
        suite.validate().expect("valid suite");
    }
}
