use std::panic::AssertUnwindSafe;

use serde::Serialize;

use crate::queue::{QueueProcessor, RequestQueue};
use crate::rate_limiter::{RateLimitHealth, RateLimiter};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetrics {
    pub requests_in_window: usize,
    pub request_limit: usize,
    pub window_seconds: u64,
    pub average_processing_time: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub queue_size: usize,
    pub current_utilization: f64,
    /// queue_size * average_processing_time + the limiter's estimated wait.
    pub estimated_wait_time: f64,
    pub rate_limit_status: RateLimitHealth,
    pub is_processing: bool,
    pub is_paused: bool,
    pub active_requests: usize,
    pub max_concurrent: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub metrics: SnapshotMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusSnapshot {
    /// Safe defaults returned when composing a snapshot fails.
    /// Observability must never block on an internal error.
    fn fallback(error: String) -> Self {
        Self {
            queue_size: 0,
            current_utilization: 0.0,
            estimated_wait_time: 0.0,
            rate_limit_status: RateLimitHealth::Healthy,
            is_processing: false,
            is_paused: false,
            active_requests: 0,
            max_concurrent: 3,
            total_processed: 0,
            total_failed: 0,
            metrics: SnapshotMetrics {
                requests_in_window: 0,
                request_limit: 0,
                window_seconds: 0,
                average_processing_time: 0.0,
            },
            error: Some(error),
        }
    }
}

/// Pure aggregation over the limiter, queue, and processor. Reads only,
/// never mutates.
#[derive(Clone)]
pub struct QueueStatusReporter {
    rate_limiter: RateLimiter,
    queue: RequestQueue,
    processor: QueueProcessor,
}

impl QueueStatusReporter {
    pub fn new(rate_limiter: RateLimiter, queue: RequestQueue, processor: QueueProcessor) -> Self {
        Self {
            rate_limiter,
            queue,
            processor,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.compose())) {
            Ok(snapshot) => snapshot,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());
                tracing::error!("Status snapshot failed, returning defaults: {}", msg);
                StatusSnapshot::fallback(msg)
            }
        }
    }

    fn compose(&self) -> StatusSnapshot {
        let rate = self.rate_limiter.status();
        let queue = self.queue.info();
        let processor = self.processor.status();

        let estimated_wait_time =
            queue.size as f64 * queue.average_processing_time + rate.estimated_wait_ms as f64;

        StatusSnapshot {
            queue_size: queue.size,
            current_utilization: rate.utilization,
            estimated_wait_time,
            rate_limit_status: rate.health(),
            is_processing: queue.is_processing,
            is_paused: processor.is_paused,
            active_requests: processor.active_requests,
            max_concurrent: processor.max_concurrent,
            total_processed: queue.total_processed,
            total_failed: queue.total_failed,
            metrics: SnapshotMetrics {
                requests_in_window: rate.current_count,
                request_limit: rate.limit,
                window_seconds: rate.window_seconds,
                average_processing_time: queue.average_processing_time,
            },
            error: None,
        }
    }
}
