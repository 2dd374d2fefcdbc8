use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::generation::GenerationTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Work item lifecycle. Transitions are monotonic:
/// Pending -> Processing -> {Completed | Failed}, or Pending -> Skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: String,
    pub payload: GenerationTask,
    pub priority: Priority,
    pub status: ItemStatus,
    pub enqueued_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    /// Items currently pending or processing.
    pub size: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    /// Running average of (completed_at - started_at), in milliseconds.
    pub average_processing_time: f64,
    pub is_processing: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: HashMap<String, WorkItem>,
    high: VecDeque<String>,
    normal: VecDeque<String>,
    low: VecDeque<String>,
    in_processing: HashSet<String>,
    total_processed: u64,
    total_failed: u64,
    processing_time_total_ms: f64,
    processing_time_samples: u64,
    is_processing: bool,
    next_seq: u64,
}

const PRIORITY_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

impl QueueInner {
    fn tier(&self, priority: Priority) -> &VecDeque<String> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<String> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pending_len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn insert(&mut self, item: WorkItem) {
        self.tier_mut(item.priority).push_back(item.id.clone());
        self.items.insert(item.id.clone(), item);
    }

    /// Claim the highest-priority, oldest pending item matching the
    /// predicate. Strict tier ordering, FIFO within a tier.
    fn claim_where<F>(&mut self, pred: F) -> Option<WorkItem>
    where
        F: Fn(&WorkItem) -> bool,
    {
        for priority in PRIORITY_ORDER {
            let pos = self
                .tier(priority)
                .iter()
                .position(|id| self.items.get(id).is_some_and(&pred));

            if let Some(pos) = pos {
                let id = self.tier_mut(priority).remove(pos)?;
                self.in_processing.insert(id.clone());
                let item = self.items.get_mut(&id)?;
                item.status = ItemStatus::Processing;
                item.started_at = Some(Instant::now());
                tracing::trace!(
                    "claimed item {} after {}ms queued",
                    item.id,
                    item.enqueued_at.elapsed().as_millis()
                );
                return Some(item.clone());
            }
        }
        None
    }
}

/// Priority-aware buffer of pending provider work. Sole owner of work items
/// for their pending/processing lifetime; terminal items are discarded and
/// live on only in the aggregate counters.
#[derive(Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new pending item, ordered by priority then insertion order.
    /// Returns the generated item id.
    pub fn enqueue(&self, payload: GenerationTask, priority: Priority) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let id = format!("item_{}", inner.next_seq);
        inner.insert(new_item(id.clone(), payload, priority));
        id
    }

    /// Insert with a caller-supplied id (batch items reuse their store ids).
    /// Returns false if the id is already present, so an item is never
    /// queued twice.
    pub fn enqueue_with_id(
        &self,
        id: impl Into<String>,
        payload: GenerationTask,
        priority: Priority,
    ) -> bool {
        let id = id.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.items.contains_key(&id) {
            return false;
        }
        inner.insert(new_item(id, payload, priority));
        true
    }

    /// Remove and return the highest-priority, oldest pending item,
    /// transitioning it to processing. None if nothing is pending.
    pub fn dequeue(&self) -> Option<WorkItem> {
        self.inner.lock().unwrap().claim_where(|_| true)
    }

    /// Same ordering as `dequeue`, restricted to items matching the
    /// predicate. Pool dispatch and per-job stepping use disjoint
    /// predicates so they never race for one another's work.
    pub fn dequeue_where<F>(&self, pred: F) -> Option<WorkItem>
    where
        F: Fn(&WorkItem) -> bool,
    {
        self.inner.lock().unwrap().claim_where(pred)
    }

    pub fn mark_completed(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.in_processing.remove(id) {
            tracing::warn!("mark_completed for item {} not in processing", id);
            return;
        }
        if let Some(mut item) = inner.items.remove(id) {
            item.status = ItemStatus::Completed;
            item.completed_at = Some(Instant::now());
            if let (Some(started), Some(completed)) = (item.started_at, item.completed_at) {
                let elapsed = completed.duration_since(started);
                inner.processing_time_total_ms += elapsed.as_secs_f64() * 1000.0;
                inner.processing_time_samples += 1;
            }
            inner.total_processed += 1;
        }
    }

    pub fn mark_failed(&self, id: &str, error: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.in_processing.remove(id) {
            tracing::warn!("mark_failed for item {} not in processing", id);
            return;
        }
        if let Some(mut item) = inner.items.remove(id) {
            item.status = ItemStatus::Failed;
            item.completed_at = Some(Instant::now());
            item.error = error;
            inner.total_failed += 1;
            tracing::debug!(
                "item {} failed: {}",
                id,
                item.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    /// Cancellation path: pending items matching the predicate become
    /// skipped and are dropped without touching the failure counter.
    /// Returns the number of items skipped. In-flight items are untouched.
    pub fn skip_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&WorkItem) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        let mut skipped = 0;
        for priority in PRIORITY_ORDER {
            let ids: Vec<String> = inner
                .tier(priority)
                .iter()
                .filter(|id| inner.items.get(*id).is_some_and(&pred))
                .cloned()
                .collect();

            if ids.is_empty() {
                continue;
            }

            inner.tier_mut(priority).retain(|id| !ids.contains(id));
            for id in &ids {
                if let Some(mut item) = inner.items.remove(id) {
                    item.status = ItemStatus::Skipped;
                    skipped += 1;
                }
            }
        }
        skipped
    }

    pub fn set_processing(&self, is_processing: bool) {
        self.inner.lock().unwrap().is_processing = is_processing;
    }

    pub fn info(&self) -> QueueMetrics {
        let inner = self.inner.lock().unwrap();
        let average_processing_time = if inner.processing_time_samples > 0 {
            inner.processing_time_total_ms / inner.processing_time_samples as f64
        } else {
            0.0
        };

        QueueMetrics {
            size: inner.pending_len() + inner.in_processing.len(),
            total_processed: inner.total_processed,
            total_failed: inner.total_failed,
            average_processing_time,
            is_processing: inner.is_processing,
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.pending_len() + inner.in_processing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn new_item(id: String, payload: GenerationTask, priority: Priority) -> WorkItem {
    WorkItem {
        id,
        payload,
        priority,
        status: ItemStatus::Pending,
        enqueued_at: Instant::now(),
        started_at: None,
        completed_at: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(topic: &str) -> GenerationTask {
        GenerationTask::direct(topic)
    }

    #[test]
    fn dequeues_in_priority_order() {
        let queue = RequestQueue::new();
        queue.enqueue(task("low"), Priority::Low);
        queue.enqueue(task("high"), Priority::High);
        queue.enqueue(task("normal"), Priority::Normal);

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|item| item.payload.topic)
            .collect();
        assert_eq!(order, vec!["high", "normal", "low"]);
    }

    #[test]
    fn fifo_within_a_priority_tier() {
        let queue = RequestQueue::new();
        for i in 0..4 {
            queue.enqueue(task(&format!("normal_{i}")), Priority::Normal);
        }

        for i in 0..4 {
            let item = queue.dequeue().unwrap();
            assert_eq!(item.payload.topic, format!("normal_{i}"));
            assert_eq!(item.status, ItemStatus::Processing);
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn counters_track_outcomes() {
        let queue = RequestQueue::new();
        let a = queue.enqueue(task("a"), Priority::Normal);
        let b = queue.enqueue(task("b"), Priority::Normal);
        queue.enqueue(task("c"), Priority::Normal);
        assert_eq!(queue.info().size, 3);

        queue.dequeue().unwrap();
        queue.dequeue().unwrap();
        queue.mark_completed(&a);
        queue.mark_failed(&b, Some("provider error".to_string()));

        let info = queue.info();
        assert_eq!(info.total_processed, 1);
        assert_eq!(info.total_failed, 1);
        assert_eq!(info.size, 1);
        assert!(info.average_processing_time >= 0.0);
    }

    #[test]
    fn terminal_marks_require_a_claim() {
        let queue = RequestQueue::new();
        let id = queue.enqueue(task("a"), Priority::Normal);

        // Not yet dequeued: neither counter may move.
        queue.mark_completed(&id);
        queue.mark_failed(&id, None);

        let info = queue.info();
        assert_eq!(info.total_processed, 0);
        assert_eq!(info.total_failed, 0);
        assert_eq!(info.size, 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let queue = RequestQueue::new();
        assert!(queue.enqueue_with_id("abc", task("a"), Priority::Normal));
        assert!(!queue.enqueue_with_id("abc", task("a"), Priority::High));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn skipped_items_do_not_count_as_failed() {
        let queue = RequestQueue::new();
        let mut batch = task("batch");
        batch.job_id = Some(uuid::Uuid::new_v4());
        queue.enqueue(batch.clone(), Priority::Normal);
        queue.enqueue(batch, Priority::Low);
        queue.enqueue(task("direct"), Priority::Normal);

        let skipped = queue.skip_where(|item| item.payload.job_id.is_some());
        assert_eq!(skipped, 2);

        let info = queue.info();
        assert_eq!(info.total_failed, 0);
        assert_eq!(info.size, 1);
        assert_eq!(queue.dequeue().unwrap().payload.topic, "direct");
    }

    #[test]
    fn dequeue_where_respects_ordering_within_filter() {
        let queue = RequestQueue::new();
        let job = uuid::Uuid::new_v4();
        let mut first = task("first");
        first.job_id = Some(job);
        let mut second = task("second");
        second.job_id = Some(job);

        queue.enqueue(task("other"), Priority::High);
        queue.enqueue(first, Priority::Normal);
        queue.enqueue(second, Priority::Normal);

        let item = queue
            .dequeue_where(|item| item.payload.job_id == Some(job))
            .unwrap();
        assert_eq!(item.payload.topic, "first");
    }

    #[test]
    fn empty_queue_reports_zero_size() {
        let queue = RequestQueue::new();
        assert!(queue.is_empty());
        let info = queue.info();
        assert_eq!(info.size, 0);
        assert_eq!(info.average_processing_time, 0.0);
    }
}
