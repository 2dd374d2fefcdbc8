use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::generation::GenerationTask;
use crate::queue::{QueueProcessor, RequestQueue};

use super::store::{JobStore, SharedJobStore};
use super::{ItemState, JobProgress, JobStatus};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay between steps so the stepping loop does not saturate the
    /// dispatcher.
    pub step_delay_ms: u64,
    /// Fail-safe against a dispatcher that never reports a terminal
    /// signal; not the primary cancellation mechanism.
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Processed,
    NoItems,
    JobCompleted,
    JobCancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessNextResponse {
    pub status: StepStatus,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub remaining_items: u32,
}

impl ProcessNextResponse {
    fn terminal(status: StepStatus, progress: JobProgress) -> Self {
        Self {
            status,
            progress,
            item_id: None,
            conversation_id: None,
            error: None,
            remaining_items: 0,
        }
    }
}

/// Advance one batch job by exactly one item. Shared by the HTTP route and
/// the server-side stepping loop; per-item failures are recorded and
/// reported but never abort the job.
pub async fn process_next_item(
    store: &SharedJobStore,
    queue: &RequestQueue,
    processor: &QueueProcessor,
    job_id: Uuid,
) -> AppResult<ProcessNextResponse> {
    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))?;

    match job.status {
        JobStatus::Cancelled => {
            return Ok(ProcessNextResponse::terminal(
                StepStatus::JobCancelled,
                job.progress(),
            ));
        }
        JobStatus::Completed | JobStatus::Failed => {
            return Ok(ProcessNextResponse::terminal(
                StepStatus::JobCompleted,
                job.progress(),
            ));
        }
        JobStatus::Paused => {
            let remaining = store.count_queued_items(job_id).await?;
            return Ok(ProcessNextResponse {
                remaining_items: remaining,
                ..ProcessNextResponse::terminal(StepStatus::NoItems, job.progress())
            });
        }
        JobStatus::Queued | JobStatus::Processing => {}
    }

    let Some(item) = store.next_queued_item(job_id).await? else {
        // Every item has been attempted; the job completes regardless of
        // per-item failures.
        store.set_job_status(job_id, JobStatus::Completed).await?;
        let job = store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))?;
        tracing::info!(
            "Job {} complete - {} successful, {} failed",
            job_id,
            job.successful_items,
            job.failed_items
        );
        return Ok(ProcessNextResponse::terminal(
            StepStatus::JobCompleted,
            job.progress(),
        ));
    };

    store
        .set_item_state(job_id, item.id, ItemState::Processing)
        .await?;
    if job.status == JobStatus::Queued {
        store.set_job_status(job_id, JobStatus::Processing).await?;
    }

    let task = GenerationTask {
        job_id: Some(job_id),
        item_id: Some(item.id),
        topic: item.topic.clone(),
        tier: item.tier.clone(),
        parameters: item.parameters.clone(),
    };
    queue.enqueue_with_id(item.id.to_string(), task, job.priority);

    let Some(outcome) = processor.execute_for_job(job_id).await else {
        // The claim was lost, which only happens when a cancel raced the
        // dispatch and skipped the queued item. Roll the store entry back
        // to match.
        let job = store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))?;
        if job.status == JobStatus::Cancelled {
            store
                .set_item_state(job_id, item.id, ItemState::Cancelled)
                .await?;
            return Ok(ProcessNextResponse::terminal(
                StepStatus::JobCancelled,
                job.progress(),
            ));
        }
        store
            .set_item_state(job_id, item.id, ItemState::Queued)
            .await?;
        let remaining = store.count_queued_items(job_id).await?;
        return Ok(ProcessNextResponse {
            remaining_items: remaining,
            ..ProcessNextResponse::terminal(StepStatus::NoItems, job.progress())
        });
    };

    let (state, conversation_id) = match &outcome.conversation {
        Some(conversation) => (ItemState::Completed, Some(conversation.conversation_id)),
        None => (ItemState::Failed, None),
    };

    let updated = store
        .record_item_outcome(job_id, item.id, state, conversation_id, outcome.error.clone())
        .await?;
    let remaining = store.count_queued_items(job_id).await?;

    Ok(ProcessNextResponse {
        status: StepStatus::Processed,
        progress: updated.progress(),
        item_id: Some(item.id),
        conversation_id,
        error: outcome.error,
        remaining_items: remaining,
    })
}

/// Drives one batch job to a terminal state by stepping the dispatcher,
/// one item per iteration. At most one loop may be active per job; starts
/// are idempotent and stops are cooperative.
pub struct BatchJobOrchestrator {
    job_id: Uuid,
    store: SharedJobStore,
    queue: RequestQueue,
    processor: QueueProcessor,
    config: OrchestratorConfig,
    running: AtomicBool,
    stop: CancellationToken,
}

impl BatchJobOrchestrator {
    pub fn new(
        job_id: Uuid,
        store: SharedJobStore,
        queue: RequestQueue,
        processor: QueueProcessor,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            store,
            queue,
            processor,
            config,
            running: AtomicBool::new(false),
            stop: CancellationToken::new(),
        })
    }

    /// Spawn the stepping loop. Calling this while a loop is already
    /// active is a no-op.
    pub fn start_processing(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Relaxed, Relaxed)
            .is_err()
        {
            tracing::debug!("Processing loop already active for job {}", self.job_id);
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run().await;
            this.running.store(false, Relaxed);
        });
    }

    async fn run(&self) {
        tracing::info!("Starting processing loop for job {}", self.job_id);

        let mut iterations = 0u32;
        loop {
            // Cooperative stop: observed at the top of each iteration, so
            // the step already in flight is never interrupted.
            if self.stop.is_cancelled() {
                tracing::info!("Processing loop for job {} stopped", self.job_id);
                break;
            }
            if iterations >= self.config.max_iterations {
                tracing::warn!(
                    "Processing loop for job {} hit the iteration cap ({})",
                    self.job_id,
                    self.config.max_iterations
                );
                break;
            }
            iterations += 1;

            let step =
                process_next_item(&self.store, &self.queue, &self.processor, self.job_id).await;

            match step {
                Ok(step) => match step.status {
                    StepStatus::Processed => {
                        if let Some(error) = &step.error {
                            tracing::warn!("Job {} item failed: {}", self.job_id, error);
                        }
                        tokio::time::sleep(Duration::from_millis(self.config.step_delay_ms)).await;
                    }
                    StepStatus::NoItems | StepStatus::JobCompleted | StepStatus::JobCancelled => {
                        tracing::info!(
                            "Processing loop for job {} finished ({:?})",
                            self.job_id,
                            step.status
                        );
                        break;
                    }
                },
                Err(error) => {
                    tracing::error!("Job {} step failed: {:?}", self.job_id, error);
                    break;
                }
            }
        }
    }

    /// Cooperative stop; the in-flight step finishes and its result is
    /// recorded.
    pub fn stop_processing(&self) {
        self.stop.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}
