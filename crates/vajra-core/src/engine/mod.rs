use serde::{Deserialize, Serialize};

pub mod controller;
pub mod executor;
pub mod ramp;
pub mod virtual_user;

pub use controller::ConcurrencyController;
pub use executor::{TestExecution, TestExecutor, TestSummary};
pub use ramp::{LinearRamp, RampStrategy, StepRamp};
pub use virtual_user::VirtualUserManager;

/// Lifecycle state of a single test.
///
/// `Ramping` and `Sustaining` are both active execution states; they exist so
/// observers can tell whether the concurrency trajectory is still climbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Pending,
    Running,
    Ramping,
    Sustaining,
    Stopping,
    Completed,
    Failed,
    Stopped,
}

impl TestStatus {
    /// True for states that hold virtual users alive.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TestStatus::Running | TestStatus::Ramping | TestStatus::Sustaining | TestStatus::Stopping
        )
    }

    /// True once the test can never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Failed | TestStatus::Stopped
        )
    }

    /// Severity ordering used when folding many statuses into one
    /// (suite results, distributed tests): Failed > Stopped > everything else.
    pub fn severity(self) -> u8 {
        match self {
            TestStatus::Failed => 3,
            TestStatus::Stopped => 2,
            TestStatus::Completed => 1,
            _ => 0,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Ramping => "ramping",
            TestStatus::Sustaining => "sustaining",
            TestStatus::Stopping => "stopping",
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
            TestStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}
