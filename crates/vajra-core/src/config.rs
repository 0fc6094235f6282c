use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::VajraError;

/// Upper bound on configured concurrency (virtual users).
pub const MAX_CONCURRENCY_LIMIT: u32 = 50_000;
/// Upper bound on the TPS throttle.
pub const MAX_TPS_LIMIT: u32 = 100_000;
/// Upper bound on test duration (24 hours).
pub const MAX_DURATION_SECONDS: u64 = 86_400;

/// Execution mode of a test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestMode {
    /// Drive a fixed trajectory of concurrent virtual users.
    #[default]
    ConcurrencyBased,
    /// Same engine with the TPS throttle engaged (`max_tps_limit` required).
    RateLimited,
}

/// Which built-in ramp strategy shapes the concurrency trajectory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RampStrategyKind {
    #[default]
    Linear,
    Step,
}

/// Immutable description of a single load test.
///
/// A config is validated once on acceptance ([`TestConfig::validate`]) and
/// never mutated afterwards; the executor owns the running state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestConfig {
    pub test_id: String,
    #[serde(default)]
    pub mode: TestMode,
    pub starting_concurrency: u32,
    pub max_concurrency: u32,
    #[serde(default)]
    pub ramp_strategy: RampStrategyKind,
    /// Concurrency added per interval (step strategy).
    #[serde(default = "default_ramp_step")]
    pub ramp_step: u32,
    /// Seconds between steps (step strategy).
    #[serde(default = "default_ramp_interval")]
    pub ramp_interval_seconds: u32,
    /// Seconds over which the linear ramp reaches `max_concurrency`.
    #[serde(default = "default_ramp_duration")]
    pub ramp_duration_seconds: u32,
    pub test_duration_seconds: u64,
    /// TPS throttle, required in RATE_LIMITED mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tps_limit: Option<u32>,
    pub task_type: String,
    #[serde(default)]
    pub task_parameters: HashMap<String, String>,
}

fn default_ramp_step() -> u32 {
    1
}

fn default_ramp_interval() -> u32 {
    1
}

fn default_ramp_duration() -> u32 {
    1
}

impl TestConfig {
    /// Minimal config for the given task type, defaulting to a flat
    /// single-user concurrency profile.
    pub fn new(test_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            mode: TestMode::ConcurrencyBased,
            starting_concurrency: 1,
            max_concurrency: 1,
            ramp_strategy: RampStrategyKind::Linear,
            ramp_step: default_ramp_step(),
            ramp_interval_seconds: default_ramp_interval(),
            ramp_duration_seconds: default_ramp_duration(),
            test_duration_seconds: 60,
            max_tps_limit: None,
            task_type: task_type.into(),
            task_parameters: HashMap::new(),
        }
    }

    /// Validate against the numeric limits and return a list of errors.
    ///
    /// An empty `Vec` means the config is acceptable.
    pub fn validate(&self) -> Vec<VajraError> {
        let mut errors = Vec::new();

        if self.test_id.trim().is_empty() {
            errors.push(VajraError::Configuration(
                "test_id must not be empty".to_string(),
            ));
        }

        if self.task_type.trim().is_empty() {
            errors.push(VajraError::Configuration(
                "task_type must not be empty".to_string(),
            ));
        }

        if self.starting_concurrency == 0 {
            errors.push(VajraError::Configuration(
                "starting_concurrency must be at least 1".to_string(),
            ));
        }

        if self.starting_concurrency > MAX_CONCURRENCY_LIMIT
            || self.max_concurrency > MAX_CONCURRENCY_LIMIT
        {
            errors.push(VajraError::Configuration(format!(
                "concurrency exceeds limit {MAX_CONCURRENCY_LIMIT}"
            )));
        }

        if self.max_concurrency < self.starting_concurrency {
            errors.push(VajraError::Configuration(format!(
                "max_concurrency ({}) must be >= starting_concurrency ({})",
                self.max_concurrency, self.starting_concurrency
            )));
        }

        if self.test_duration_seconds == 0 || self.test_duration_seconds > MAX_DURATION_SECONDS {
            errors.push(VajraError::Configuration(format!(
                "test_duration_seconds must be in 1..={MAX_DURATION_SECONDS}"
            )));
        }

        match self.mode {
            TestMode::RateLimited => match self.max_tps_limit {
                None => errors.push(VajraError::Configuration(
                    "max_tps_limit is required in RATE_LIMITED mode".to_string(),
                )),
                Some(tps) if tps == 0 || tps > MAX_TPS_LIMIT => {
                    errors.push(VajraError::Configuration(format!(
                        "max_tps_limit must be in 1..={MAX_TPS_LIMIT}"
                    )))
                }
                Some(_) => {}
            },
            TestMode::ConcurrencyBased => {
                if self.max_tps_limit.is_some() {
                    errors.push(VajraError::Configuration(
                        "max_tps_limit is only valid in RATE_LIMITED mode".to_string(),
                    ));
                }
            }
        }

        match self.ramp_strategy {
            RampStrategyKind::Linear => {
                if self.ramp_duration_seconds == 0
                    || u64::from(self.ramp_duration_seconds) > self.test_duration_seconds
                {
                    errors.push(VajraError::Configuration(
                        "ramp_duration_seconds must be in 1..=test_duration_seconds".to_string(),
                    ));
                }
            }
            RampStrategyKind::Step => {
                if self.ramp_interval_seconds == 0
                    || u64::from(self.ramp_interval_seconds) > self.test_duration_seconds
                {
                    errors.push(VajraError::Configuration(
                        "ramp_interval_seconds must be in 1..=test_duration_seconds".to_string(),
                    ));
                }
                if self.ramp_step == 0 {
                    errors.push(VajraError::Configuration(
                        "ramp_step must be at least 1".to_string(),
                    ));
                } else if self.max_concurrency > self.starting_concurrency
                    && self.ramp_step > self.max_concurrency - self.starting_concurrency
                {
                    errors.push(VajraError::Configuration(format!(
                        "ramp_step must not exceed max_concurrency - starting_concurrency ({})",
                        self.max_concurrency - self.starting_concurrency
                    )));
                }
            }
        }

        errors
    }

    /// Elapsed seconds at which the ramp reaches `max_concurrency`.
    ///
    /// Used to distinguish the RAMPING and SUSTAINING phases.
    pub fn ramp_end_seconds(&self) -> u64 {
        if self.max_concurrency <= self.starting_concurrency {
            return 0;
        }
        match self.ramp_strategy {
            RampStrategyKind::Linear => u64::from(self.ramp_duration_seconds),
            RampStrategyKind::Step => {
                let delta = u64::from(self.max_concurrency - self.starting_concurrency);
                let step = u64::from(self.ramp_step.max(1));
                let steps_needed = delta.div_ceil(step);
                steps_needed * u64::from(self.ramp_interval_seconds)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_config() -> TestConfig {
        TestConfig {
            starting_concurrency: 10,
            max_concurrency: 100,
            ramp_duration_seconds: 60,
            test_duration_seconds: 120,
            ..TestConfig::new("test-1", "SLEEP")
        }
    }

    #[test]
    fn valid_linear_config_has_no_errors() {
        let errors = linear_config().validate();
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn empty_test_id_rejected() {
        let mut cfg = linear_config();
        cfg.test_id = "  ".to_string();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.to_string().contains("test_id")));
    }

    #[test]
    fn zero_starting_concurrency_rejected() {
        let mut cfg = linear_config();
        cfg.starting_concurrency = 0;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("starting_concurrency")));
    }

    #[test]
    fn concurrency_over_limit_rejected() {
        let mut cfg = linear_config();
        cfg.max_concurrency = 60_000;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("concurrency exceeds limit 50000")));
    }

    #[test]
    fn max_below_starting_rejected() {
        let mut cfg = linear_config();
        cfg.starting_concurrency = 50;
        cfg.max_concurrency = 10;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("must be >= starting_concurrency")));
    }

    #[test]
    fn duration_over_24h_rejected() {
        let mut cfg = linear_config();
        cfg.test_duration_seconds = 86_401;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("test_duration_seconds")));
    }

    #[test]
    fn rate_limited_requires_tps_limit() {
        let mut cfg = linear_config();
        cfg.mode = TestMode::RateLimited;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("max_tps_limit is required")));
    }

    #[test]
    fn rate_limited_tps_over_limit_rejected() {
        let mut cfg = linear_config();
        cfg.mode = TestMode::RateLimited;
        cfg.max_tps_limit = Some(100_001);
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("max_tps_limit must be in")));
    }

    #[test]
    fn tps_limit_in_concurrency_mode_rejected() {
        let mut cfg = linear_config();
        cfg.max_tps_limit = Some(500);
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("only valid in RATE_LIMITED")));
    }

    #[test]
    fn ramp_longer_than_duration_rejected() {
        let mut cfg = linear_config();
        cfg.ramp_duration_seconds = 200;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("ramp_duration_seconds")));
    }

    #[test]
    fn step_config_validates_step_bounds() {
        let mut cfg = linear_config();
        cfg.ramp_strategy = RampStrategyKind::Step;
        cfg.ramp_step = 95; // max - starting = 90
        cfg.ramp_interval_seconds = 5;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("ramp_step must not exceed")));
    }

    #[test]
    fn step_config_zero_step_rejected() {
        let mut cfg = linear_config();
        cfg.ramp_strategy = RampStrategyKind::Step;
        cfg.ramp_step = 0;
        cfg.ramp_interval_seconds = 5;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("ramp_step must be at least 1")));
    }

    #[test]
    fn multiple_errors_accumulate() {
        let mut cfg = linear_config();
        cfg.test_id = String::new();
        cfg.starting_concurrency = 0;
        cfg.test_duration_seconds = 0;
        let errors = cfg.validate();
        assert!(errors.len() >= 3, "expected >= 3 errors, got: {errors:?}");
    }

    #[test]
    fn ramp_end_linear_is_ramp_duration() {
        let cfg = linear_config();
        assert_eq!(cfg.ramp_end_seconds(), 60);
    }

    #[test]
    fn ramp_end_step_rounds_up_to_whole_steps() {
        let mut cfg = linear_config();
        cfg.ramp_strategy = RampStrategyKind::Step;
        cfg.ramp_step = 10;
        cfg.ramp_interval_seconds = 30;
        // 90 of delta at 10 per 30 s => 9 steps => 270 s.
        assert_eq!(cfg.ramp_end_seconds(), 270);
    }

    #[test]
    fn ramp_end_flat_profile_is_zero() {
        let mut cfg = linear_config();
        cfg.starting_concurrency = 100;
        cfg.max_concurrency = 100;
        assert_eq!(cfg.ramp_end_seconds(), 0);
    }

    #[test]
    fn config_json_roundtrip() {
        let cfg = linear_config();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let parsed: TestConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.test_id, cfg.test_id);
        assert_eq!(parsed.mode, cfg.mode);
        assert_eq!(parsed.max_concurrency, cfg.max_concurrency);
    }

    #[test]
    fn mode_serializes_screaming_snake() {
        let json = serde_json::to_string(&TestMode::RateLimited).expect("serialize");
        assert_eq!(json, "\"RATE_LIMITED\"");
        let json = serde_json::to_string(&RampStrategyKind::Step).expect("serialize");
        assert_eq!(json, "\"STEP\"");
    }
}
