use crate::config::TestConfig;
use crate::engine::ramp::{self, RampStrategy};
use crate::error::VajraError;

/// Combines a ramp strategy, the concurrency cap, and the optional TPS
/// throttle into the single decision surface the control loop consults.
pub struct ConcurrencyController {
    strategy: Box<dyn RampStrategy>,
    starting_concurrency: u32,
    max_concurrency: u32,
    max_tps: Option<f64>,
}

impl ConcurrencyController {
    pub fn from_config(config: &TestConfig) -> Result<Self, VajraError> {
        Ok(Self {
            strategy: ramp::from_config(config)?,
            starting_concurrency: config.starting_concurrency,
            max_concurrency: config.max_concurrency,
            max_tps: config.max_tps_limit.map(f64::from),
        })
    }

    /// Target virtual-user count for the given elapsed seconds.
    pub fn target_concurrency(&self, elapsed_seconds: f64) -> u32 {
        self.strategy
            .target_concurrency(elapsed_seconds)
            .min(self.max_concurrency)
    }

    /// True when the current TPS has reached the configured throttle.
    /// Always false without a throttle.
    pub fn should_throttle(&self, current_tps: f64) -> bool {
        match self.max_tps {
            Some(limit) => current_tps >= limit,
            None => false,
        }
    }

    /// Ramp completion as a percentage in [0, 100].
    pub fn ramp_progress(&self, elapsed_seconds: f64) -> f64 {
        if self.max_concurrency == self.starting_concurrency {
            return 100.0;
        }
        let current = self.target_concurrency(elapsed_seconds);
        let span = f64::from(self.max_concurrency - self.starting_concurrency);
        let progress = f64::from(current - self.starting_concurrency) / span * 100.0;
        progress.clamp(0.0, 100.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
