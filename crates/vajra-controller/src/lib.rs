pub mod aggregator;
pub mod coordinator;
pub mod distributor;
pub mod registry;

pub use aggregator::MetricsAggregator;
pub use coordinator::{ControllerSettings, Coordinator, DistributedTestStatus};
pub use distributor::{DistributedTestRequest, TaskDistributor, WorkerShare};
pub use registry::{WorkerInfo, WorkerManager};
