pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod preflight;
pub mod suite;
pub mod task;

pub use config::{TestConfig, TestMode};
pub use engine::{TestExecutor, TestStatus};
pub use error::VajraError;
pub use metrics::{MetricsCollector, MetricsSnapshot};
