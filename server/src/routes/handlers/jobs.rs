use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppJsonResult};
use crate::jobs::orchestrator::{process_next_item, ProcessNextResponse};
use crate::jobs::store::JobStore;
use crate::jobs::{BatchItem, BatchJob, JobProgress, JobStatus};
use crate::queue::Priority;
use crate::ServerState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobItem {
    pub topic: String,
    pub tier: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub name: Option<String>,
    pub priority: Option<Priority>,
    pub items: Vec<CreateJobItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<BatchJob> for JobView {
    fn from(job: BatchJob) -> Self {
        let progress = job.progress();
        Self {
            job_id: job.id,
            name: job.name,
            status: job.status,
            priority: job.priority,
            progress,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: JobAction,
}

pub async fn create_job(
    State(state): State<ServerState>,
    Json(req): Json<CreateJobRequest>,
) -> AppJsonResult<JobView> {
    if req.items.is_empty() {
        return Err(AppError::BadRequest(
            "a batch job needs at least one item".to_string(),
        ));
    }

    let name = req
        .name
        .unwrap_or_else(|| format!("Batch {}", Utc::now().format("%Y-%m-%d %H:%M")));
    let priority = req.priority.unwrap_or(Priority::Normal);
    let job = BatchJob::new(name, priority, req.items.len() as u32);
    let job_id = job.id;

    let items = req
        .items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let mut batch_item = BatchItem::new(job_id, i as u32 + 1, item.topic);
            batch_item.tier = item.tier;
            batch_item.parameters = item.parameters;
            batch_item
        })
        .collect();

    state.job_store.insert_job(job.clone(), items).await?;
    tracing::info!("Created batch job {} ({} items)", job_id, job.total_items);

    // A freshly observed queued job gets its stepping loop exactly once.
    state.runner_map.ensure_running(job_id);

    Ok(Json(job.into()))
}

pub async fn list_jobs(State(state): State<ServerState>) -> AppJsonResult<Vec<JobView>> {
    let jobs = state.job_store.list_jobs().await?;
    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

pub async fn get_job(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
) -> AppJsonResult<JobView> {
    let job = state
        .job_store
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))?;
    Ok(Json(job.into()))
}

/// Advance the job by exactly one item. Intended for external pollers
/// stepping a job to completion over many requests.
pub async fn process_next(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
) -> AppJsonResult<ProcessNextResponse> {
    let response =
        process_next_item(&state.job_store, &state.request_queue, &state.processor, id).await?;
    Ok(Json(response))
}

pub async fn control_job(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ControlRequest>,
) -> AppJsonResult<JobView> {
    let job = state
        .job_store
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))?;

    match req.action {
        JobAction::Pause => {
            if !matches!(job.status, JobStatus::Queued | JobStatus::Processing) {
                return Err(AppError::Conflict(format!(
                    "cannot pause a job in {:?} state",
                    job.status
                )));
            }
            state.job_store.set_job_status(id, JobStatus::Paused).await?;
            tracing::info!("Paused job {}", id);
        }
        JobAction::Resume => {
            if job.status != JobStatus::Paused {
                return Err(AppError::Conflict(format!(
                    "cannot resume a job in {:?} state",
                    job.status
                )));
            }
            state
                .job_store
                .set_job_status(id, JobStatus::Processing)
                .await?;
            state.runner_map.ensure_running(id);
            tracing::info!("Resumed job {}", id);
        }
        JobAction::Cancel => {
            // Terminal and irreversible. Remaining items are skipped, the
            // in-flight dispatch (if any) finishes and is still recorded.
            if job.status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "job is already in {:?} state",
                    job.status
                )));
            }
            state
                .job_store
                .set_job_status(id, JobStatus::Cancelled)
                .await?;
            let cancelled = state.job_store.cancel_remaining_items(id).await?;
            let skipped = state
                .request_queue
                .skip_where(|item| item.payload.job_id == Some(id));
            state.runner_map.stop(id);
            tracing::info!(
                "Cancelled job {} ({} items cancelled, {} skipped in queue)",
                id,
                cancelled,
                skipped
            );
        }
    }

    let job = state
        .job_store
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))?;
    Ok(Json(job.into()))
}
