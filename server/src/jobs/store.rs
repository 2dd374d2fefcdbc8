use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{BatchItem, BatchJob, ItemState, JobStatus};

pub type SharedJobStore = Arc<dyn JobStore>;

/// Durable store for job and work-item records. Opaque CRUD surface; the
/// dispatch core never assumes anything about the backing schema.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: BatchJob, items: Vec<BatchItem>) -> anyhow::Result<()>;
    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<BatchJob>>;
    async fn list_jobs(&self) -> anyhow::Result<Vec<BatchJob>>;
    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> anyhow::Result<()>;

    /// The job's lowest-position item still queued, if any.
    async fn next_queued_item(&self, job_id: Uuid) -> anyhow::Result<Option<BatchItem>>;
    async fn count_queued_items(&self, job_id: Uuid) -> anyhow::Result<u32>;
    async fn set_item_state(
        &self,
        job_id: Uuid,
        item_id: Uuid,
        state: ItemState,
    ) -> anyhow::Result<()>;

    /// Record a terminal item outcome and bump the job counters in one
    /// step. Returns the updated job.
    async fn record_item_outcome(
        &self,
        job_id: Uuid,
        item_id: Uuid,
        state: ItemState,
        conversation_id: Option<Uuid>,
        error: Option<String>,
    ) -> anyhow::Result<BatchJob>;

    /// Cancellation path: every still-queued item becomes cancelled.
    /// Returns the number of items affected.
    async fn cancel_remaining_items(&self, job_id: Uuid) -> anyhow::Result<u32>;
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<Uuid, BatchJob>,
    items: HashMap<Uuid, Vec<BatchItem>>,
}

/// In-memory record store. Stands in for the dashboard's database in this
/// repo; swapping in a persistent backend only means re-implementing the
/// trait.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: BatchJob, mut items: Vec<BatchItem>) -> anyhow::Result<()> {
        items.sort_by_key(|item| item.position);
        let mut inner = self.inner.write().unwrap();
        if inner.jobs.contains_key(&job.id) {
            anyhow::bail!("job {} already exists", job.id);
        }
        inner.items.insert(job.id, items);
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<BatchJob>> {
        Ok(self.inner.read().unwrap().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self) -> anyhow::Result<Vec<BatchJob>> {
        let inner = self.inner.read().unwrap();
        let mut jobs: Vec<BatchJob> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| std::cmp::Reverse(job.created_at));
        Ok(jobs)
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("job {} not found", job_id))?;

        job.status = status;
        match status {
            JobStatus::Processing if job.started_at.is_none() => {
                job.started_at = Some(Utc::now());
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                job.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    async fn next_queued_item(&self, job_id: Uuid) -> anyhow::Result<Option<BatchItem>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.items.get(&job_id).and_then(|items| {
            items
                .iter()
                .find(|item| item.status == ItemState::Queued)
                .cloned()
        }))
    }

    async fn count_queued_items(&self, job_id: Uuid) -> anyhow::Result<u32> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .items
            .get(&job_id)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.status == ItemState::Queued)
                    .count() as u32
            })
            .unwrap_or(0))
    }

    async fn set_item_state(
        &self,
        job_id: Uuid,
        item_id: Uuid,
        state: ItemState,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        let item = inner
            .items
            .get_mut(&job_id)
            .and_then(|items| items.iter_mut().find(|item| item.id == item_id))
            .ok_or_else(|| anyhow::anyhow!("item {} not found in job {}", item_id, job_id))?;
        item.status = state;
        Ok(())
    }

    async fn record_item_outcome(
        &self,
        job_id: Uuid,
        item_id: Uuid,
        state: ItemState,
        conversation_id: Option<Uuid>,
        error: Option<String>,
    ) -> anyhow::Result<BatchJob> {
        let mut inner = self.inner.write().unwrap();

        let item = inner
            .items
            .get_mut(&job_id)
            .and_then(|items| items.iter_mut().find(|item| item.id == item_id))
            .ok_or_else(|| anyhow::anyhow!("item {} not found in job {}", item_id, job_id))?;
        item.status = state;
        item.conversation_id = conversation_id;
        item.error = error;

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("job {} not found", job_id))?;
        job.completed_items += 1;
        match state {
            ItemState::Completed => job.successful_items += 1,
            ItemState::Failed => job.failed_items += 1,
            _ => anyhow::bail!("item outcome must be terminal, got {:?}", state),
        }
        Ok(job.clone())
    }

    async fn cancel_remaining_items(&self, job_id: Uuid) -> anyhow::Result<u32> {
        let mut inner = self.inner.write().unwrap();
        let mut cancelled = 0;
        if let Some(items) = inner.items.get_mut(&job_id) {
            for item in items.iter_mut() {
                if item.status == ItemState::Queued {
                    item.status = ItemState::Cancelled;
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;

    fn seed(n: u32) -> (BatchJob, Vec<BatchItem>) {
        let job = BatchJob::new("seed".to_string(), Priority::Normal, n);
        let items = (1..=n)
            .map(|position| BatchItem::new(job.id, position, format!("topic_{position}")))
            .collect();
        (job, items)
    }

    #[tokio::test]
    async fn items_are_claimed_in_position_order() {
        let store = InMemoryJobStore::new();
        let (job, items) = seed(3);
        let job_id = job.id;
        store.insert_job(job, items).await.unwrap();

        let first = store.next_queued_item(job_id).await.unwrap().unwrap();
        assert_eq!(first.position, 1);

        store
            .set_item_state(job_id, first.id, ItemState::Processing)
            .await
            .unwrap();
        let second = store.next_queued_item(job_id).await.unwrap().unwrap();
        assert_eq!(second.position, 2);
        assert_eq!(store.count_queued_items(job_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn outcome_recording_updates_job_counters() {
        let store = InMemoryJobStore::new();
        let (job, items) = seed(2);
        let job_id = job.id;
        let first_id = items[0].id;
        let second_id = items[1].id;
        store.insert_job(job, items).await.unwrap();

        let job = store
            .record_item_outcome(job_id, first_id, ItemState::Completed, Some(Uuid::new_v4()), None)
            .await
            .unwrap();
        assert_eq!(job.completed_items, 1);
        assert_eq!(job.successful_items, 1);

        let job = store
            .record_item_outcome(
                job_id,
                second_id,
                ItemState::Failed,
                None,
                Some("provider error".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(job.completed_items, 2);
        assert_eq!(job.failed_items, 1);
    }

    #[tokio::test]
    async fn status_transitions_stamp_timestamps() {
        let store = InMemoryJobStore::new();
        let (job, items) = seed(1);
        let job_id = job.id;
        store.insert_job(job, items).await.unwrap();

        store
            .set_job_status(job_id, JobStatus::Processing)
            .await
            .unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        store
            .set_job_status(job_id, JobStatus::Completed)
            .await
            .unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_remaining_skips_only_queued() {
        let store = InMemoryJobStore::new();
        let (job, items) = seed(3);
        let job_id = job.id;
        let first_id = items[0].id;
        store.insert_job(job, items).await.unwrap();

        store
            .set_item_state(job_id, first_id, ItemState::Processing)
            .await
            .unwrap();

        let cancelled = store.cancel_remaining_items(job_id).await.unwrap();
        assert_eq!(cancelled, 2);
        assert_eq!(store.count_queued_items(job_id).await.unwrap(), 0);
    }
}
