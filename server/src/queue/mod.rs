pub mod processor;
pub mod request_queue;

pub use processor::{ItemOutcome, ProcessorConfig, ProcessorStatus, QueueProcessor};
pub use request_queue::{ItemStatus, Priority, QueueMetrics, RequestQueue, WorkItem};
