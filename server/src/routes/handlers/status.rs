use axum::{extract::State, Json};

use crate::observability::{QueueStatusReporter, StatusSnapshot};

/// Composed dispatch status. Always 200-shaped: internal failures become a
/// safe-default snapshot with an `error` field instead of a 5xx.
pub async fn get_queue_status(
    State(reporter): State<QueueStatusReporter>,
) -> Json<StatusSnapshot> {
    Json(reporter.snapshot())
}
