use crate::config::{RampStrategyKind, TestConfig};
use crate::error::VajraError;

/// Maps elapsed test time to a target virtual-user count.
///
/// Strategies are pure given their configuration: the same elapsed value
/// always yields the same target, and targets are monotonically
/// non-decreasing over the ramp window.
pub trait RampStrategy: Send + Sync {
    fn target_concurrency(&self, elapsed_seconds: f64) -> u32;
}

/// Straight-line interpolation from `start` to `max` over `ramp_duration`
/// seconds.
pub struct LinearRamp {
    start: u32,
    max: u32,
    ramp_duration_seconds: u32,
}

impl LinearRamp {
    pub fn new(start: u32, max: u32, ramp_duration_seconds: u32) -> Result<Self, VajraError> {
        if start == 0 {
            return Err(VajraError::Configuration(
                "ramp start must be at least 1".to_string(),
            ));
        }
        if max < start {
            return Err(VajraError::Configuration(
                "ramp max must be >= start".to_string(),
            ));
        }
        if ramp_duration_seconds == 0 {
            return Err(VajraError::Configuration(
                "ramp duration must be at least 1 second".to_string(),
            ));
        }
        Ok(Self {
            start,
            max,
            ramp_duration_seconds,
        })
    }
}

impl RampStrategy for LinearRamp {
    fn target_concurrency(&self, elapsed_seconds: f64) -> u32 {
        if elapsed_seconds <= 0.0 {
            return self.start;
        }
        let duration = f64::from(self.ramp_duration_seconds);
        if elapsed_seconds >= duration {
            return self.max;
        }
        let span = f64::from(self.max - self.start);
        let value = f64::from(self.start) + span * elapsed_seconds / duration;
        (value.round() as u32).clamp(self.start, self.max)
    }
}

/// Discrete jumps of `step` users every `interval_seconds`, starting from
/// `start` and capped at `max`.
pub struct StepRamp {
    start: u32,
    step: u32,
    interval_seconds: u32,
    max: u32,
}

impl StepRamp {
    pub fn new(start: u32, step: u32, interval_seconds: u32, max: u32) -> Result<Self, VajraError> {
        if start == 0 {
            return Err(VajraError::Configuration(
                "ramp start must be at least 1".to_string(),
            ));
        }
        if max < start {
            return Err(VajraError::Configuration(
                "ramp max must be >= start".to_string(),
            ));
        }
        if step == 0 {
            return Err(VajraError::Configuration(
                "ramp step must be at least 1".to_string(),
            ));
        }
        if interval_seconds == 0 {
            return Err(VajraError::Configuration(
                "ramp interval must be at least 1 second".to_string(),
            ));
        }
        Ok(Self {
            start,
            step,
            interval_seconds,
            max,
        })
    }
}

impl RampStrategy for StepRamp {
    fn target_concurrency(&self, elapsed_seconds: f64) -> u32 {
        if elapsed_seconds <= 0.0 {
            return self.start;
        }
        let completed = (elapsed_seconds / f64::from(self.interval_seconds)).floor() as u64;
        let value = u64::from(self.start).saturating_add(completed.saturating_mul(u64::from(self.step)));
        let value = value.min(u64::from(u32::MAX)) as u32;
        value.clamp(self.start, self.max)
    }
}

/// Build the strategy a config asks for.
pub fn from_config(config: &TestConfig) -> Result<Box<dyn RampStrategy>, VajraError> {
    match config.ramp_strategy {
        RampStrategyKind::Linear => Ok(Box::new(LinearRamp::new(
            config.starting_concurrency,
            config.max_concurrency,
            config.ramp_duration_seconds,
        )?)),
        RampStrategyKind::Step => Ok(Box::new(StepRamp::new(
            config.starting_concurrency,
            config.ramp_step,
            config.ramp_interval_seconds,
            config.max_concurrency,
        )?)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
