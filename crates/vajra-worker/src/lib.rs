pub mod runtime;
pub mod stream;

pub use runtime::{WorkerConfig, WorkerRuntime};
pub use stream::MetricsStreamer;
