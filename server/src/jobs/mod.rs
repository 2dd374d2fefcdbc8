pub mod orchestrator;
pub mod runner_map;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::Priority;

/// Batch job lifecycle. `Failed` is reserved for job-level fatal
/// conditions; per-item failures are tracked in the progress counters
/// while the job still completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Store-side state of one batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub total: u32,
    pub completed: u32,
    pub successful: u32,
    pub failed: u32,
    pub percentage: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub total_items: u32,
    pub completed_items: u32,
    pub successful_items: u32,
    pub failed_items: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(name: String, priority: Priority, total_items: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            status: JobStatus::Queued,
            priority,
            total_items,
            completed_items: 0,
            successful_items: 0,
            failed_items: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn progress(&self) -> JobProgress {
        let percentage = if self.total_items == 0 {
            0.0
        } else {
            (self.completed_items as f32 / self.total_items as f32 * 100.0).round()
        };

        JobProgress {
            total: self.total_items,
            completed: self.completed_items,
            successful: self.successful_items,
            failed: self.failed_items,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub id: Uuid,
    pub job_id: Uuid,
    pub position: u32,
    pub topic: String,
    pub tier: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub status: ItemState,
    pub conversation_id: Option<Uuid>,
    pub error: Option<String>,
}

impl BatchItem {
    pub fn new(job_id: Uuid, position: u32, topic: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            position,
            topic,
            tier: None,
            parameters: serde_json::Value::Null,
            status: ItemState::Queued,
            conversation_id: None,
            error: None,
        }
    }
}
