use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::VajraError;
use crate::task::{Task, TaskError, TaskFactory, TaskOutput};

const MIN_SLEEP_MS: u64 = 1;
const MAX_SLEEP_MS: u64 = 60_000;

/// Factory for the `SLEEP` task type: each invocation suspends for a fixed
/// duration. Useful for engine tests where task latency must be predictable.
pub struct SleepTaskFactory {
    duration: Duration,
}

impl SleepTaskFactory {
    pub fn from_parameters(params: &HashMap<String, String>) -> Result<Self, VajraError> {
        let raw = params.get("duration").ok_or_else(|| {
            VajraError::Configuration("SLEEP task requires a duration parameter".to_string())
        })?;
        let ms: u64 = raw.parse().map_err(|_| {
            VajraError::Configuration(format!("duration must be an integer (got '{raw}')"))
        })?;
        if !(MIN_SLEEP_MS..=MAX_SLEEP_MS).contains(&ms) {
            return Err(VajraError::Configuration(format!(
                "duration must be in {MIN_SLEEP_MS}..={MAX_SLEEP_MS} ms"
            )));
        }
        Ok(Self {
            duration: Duration::from_millis(ms),
        })
    }
}

impl TaskFactory for SleepTaskFactory {
    fn task_type(&self) -> &str {
        "SLEEP"
    }

    fn create_task(&self) -> Box<dyn Task> {
        Box::new(SleepTask {
            duration: self.duration,
        })
    }
}

struct SleepTask {
    duration: Duration,
}

#[async_trait]
impl Task for SleepTask {
    async fn execute(&self) -> Result<TaskOutput, TaskError> {
        tokio::time::sleep(self.duration).await;
        Ok(TaskOutput::default())
    }
}

/// Factory for the `CPU` task type: each invocation runs a busy arithmetic
/// loop for the configured iteration count.
pub struct CpuTaskFactory {
    iterations: u64,
}

impl CpuTaskFactory {
    pub fn from_parameters(params: &HashMap<String, String>) -> Result<Self, VajraError> {
        let raw = params.get("iterations").ok_or_else(|| {
            VajraError::Configuration("CPU task requires an iterations parameter".to_string())
        })?;
        let iterations: u64 = raw.parse().map_err(|_| {
            VajraError::Configuration(format!("iterations must be an integer (got '{raw}')"))
        })?;
        if iterations == 0 {
            return Err(VajraError::Configuration(
                "iterations must be greater than zero".to_string(),
            ));
        }
        Ok(Self { iterations })
    }
}

impl TaskFactory for CpuTaskFactory {
    fn task_type(&self) -> &str {
        "CPU"
    }

    fn create_task(&self) -> Box<dyn Task> {
        Box::new(CpuTask {
            iterations: self.iterations,
        })
    }
}

struct CpuTask {
    iterations: u64,
}

#[async_trait]
impl Task for CpuTask {
    async fn execute(&self) -> Result<TaskOutput, TaskError> {
        let mut acc: u64 = 0x9e3779b9;
        for i in 0..self.iterations {
            acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
        }
        // Keep the loop from being optimised away.
        std::hint::black_box(acc);
        Ok(TaskOutput::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
