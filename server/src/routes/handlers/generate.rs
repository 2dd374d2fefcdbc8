use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppJsonResult};
use crate::generation::GenerationTask;
use crate::queue::Priority;
use crate::ServerState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub topic: String,
    pub priority: Option<Priority>,
    pub tier: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub item_id: String,
    pub queue_size: usize,
}

/// Enqueue a direct (non-batch) generation request for pool dispatch.
pub async fn enqueue_generation(
    State(state): State<ServerState>,
    Json(req): Json<GenerateRequest>,
) -> AppJsonResult<GenerateResponse> {
    if req.topic.trim().is_empty() {
        return Err(AppError::BadRequest("topic is required".to_string()));
    }

    let task = GenerationTask {
        job_id: None,
        item_id: None,
        topic: req.topic,
        tier: req.tier,
        parameters: req.parameters,
    };

    let item_id = state
        .request_queue
        .enqueue(task, req.priority.unwrap_or(Priority::Normal));
    let queue_size = state.request_queue.info().size;

    Ok(Json(GenerateResponse {
        item_id,
        queue_size,
    }))
}
