//! Observability Module
//!
//! Read-only views over the dispatch system: the composed status snapshot
//! served to clients and a periodic log of dispatcher health.

mod reporter;

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::jobs::runner_map::JobRunnerMap;

pub use reporter::{QueueStatusReporter, SnapshotMetrics, StatusSnapshot};

/// Periodically log a status snapshot and reap finished job runners.
pub fn watch(reporter: QueueStatusReporter, runner_map: JobRunnerMap) -> JoinHandle<()> {
    let mut interval = interval(Duration::from_secs(5));
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            runner_map.cleanup_finished();
            let snapshot = reporter.snapshot();
            tracing::info!(
                "Dispatch Status: queue {} active {}/{} window {}/{} ({:.1}%) processed {} failed {} jobs {}",
                snapshot.queue_size,
                snapshot.active_requests,
                snapshot.max_concurrent,
                snapshot.metrics.requests_in_window,
                snapshot.metrics.request_limit,
                snapshot.current_utilization,
                snapshot.total_processed,
                snapshot.total_failed,
                runner_map.active_count(),
            );
        }
    })
}
