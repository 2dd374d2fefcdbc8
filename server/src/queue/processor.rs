use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::generation::provider::GenerationProvider;
use crate::generation::{GeneratedConversation, GenerationTask};
use crate::rate_limiter::RateLimiter;

use super::request_queue::{RequestQueue, WorkItem};

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProcessorConfig {
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    /// How long to back off when the rate window is saturated.
    pub rate_limit_pause_ms: u64,
    /// Bounded retries for transient provider errors. Default policy is
    /// no automatic retry.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStatus {
    pub is_paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_until: Option<i64>,
    pub active_requests: usize,
    pub max_concurrent: usize,
}

/// Result of a single dispatched item, handed back to the caller that
/// drove the dispatch.
#[derive(Debug)]
pub struct ItemOutcome {
    pub item_id: String,
    pub conversation: Option<GeneratedConversation>,
    pub error: Option<String>,
}

/// Bounded worker pool between the request queue and the provider.
/// Lifecycle: stopped -> running -> {paused, stopped}; pause is a flag on
/// the running state, cleared lazily once the deadline passes.
#[derive(Clone)]
pub struct QueueProcessor {
    config: ProcessorConfig,
    queue: RequestQueue,
    rate_limiter: RateLimiter,
    provider: Arc<dyn GenerationProvider>,
    active_requests: Arc<AtomicUsize>,
    pause_until: Arc<Mutex<Option<Instant>>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Mutex<Option<CancellationToken>>>,
}

impl QueueProcessor {
    pub fn new(
        config: ProcessorConfig,
        queue: RequestQueue,
        rate_limiter: RateLimiter,
        provider: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            config,
            queue,
            rate_limiter,
            provider,
            active_requests: Arc::new(AtomicUsize::new(0)),
            pause_until: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Mutex::new(None)),
        }
    }

    /// Begin the background dispatch loop. Idempotent while running.
    pub fn start(&self) {
        if self.running.swap(true, Relaxed) {
            tracing::warn!("queue processor already running");
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap() = Some(token.clone());
        self.queue.set_processing(true);
        tracing::info!(
            "Starting queue processor ({} workers, {}ms poll)",
            self.config.max_concurrent,
            self.config.poll_interval_ms
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.run(token).await;
        });
    }

    /// Halt the dispatch loop. In-flight dispatches finish naturally and
    /// their results are still recorded.
    pub fn stop(&self) {
        if let Some(token) = self.shutdown.lock().unwrap().take() {
            token.cancel();
        }
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Queue processor shutting down");
                    break;
                }
                _ = interval.tick() => {}
            }

            if self.is_paused() {
                continue;
            }

            if !self.rate_limiter.has_capacity() {
                tracing::debug!("Rate window saturated, pausing dispatch");
                self.pause(Duration::from_millis(self.config.rate_limit_pause_ms));
                continue;
            }

            // The slot is reserved before the item is claimed, so the pool
            // can never exceed max_concurrent.
            if !self.try_acquire_slot() {
                continue;
            }

            // Batch items are dispatched by their job's stepping loop; the
            // pool only picks up direct requests.
            let Some(item) = self
                .queue
                .dequeue_where(|item| item.payload.job_id.is_none())
            else {
                self.active_requests.fetch_sub(1, Relaxed);
                continue;
            };

            let this = self.clone();
            tokio::spawn(async move {
                let item_id = item.id.clone();
                let result = AssertUnwindSafe(this.dispatch(item)).catch_unwind().await;
                if let Err(panic) = result {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "Unknown panic".to_string());
                    tracing::error!("Dispatch of item {} panicked, recovering: {}", item_id, msg);
                }
                this.active_requests.fetch_sub(1, Relaxed);
            });
        }

        self.queue.set_processing(false);
        self.running.store(false, Relaxed);
    }

    async fn dispatch(&self, item: WorkItem) {
        self.rate_limiter.add_request(item.id.clone());

        match self.invoke_with_retry(&item.payload).await {
            Ok(conversation) => {
                tracing::debug!(
                    "Item {} completed ({} tokens, {} bytes)",
                    item.id,
                    conversation.token_usage,
                    conversation.content.len()
                );
                self.queue.mark_completed(&item.id);
            }
            Err(error) => {
                tracing::error!("Item {} failed: {}", item.id, error);
                self.queue.mark_failed(&item.id, Some(error));
            }
        }
    }

    /// Reserve one of the max_concurrent dispatch slots. Compare-exchange
    /// so concurrent reservations can never push active_requests past the
    /// bound.
    fn try_acquire_slot(&self) -> bool {
        let mut active = self.active_requests.load(Relaxed);
        while active < self.config.max_concurrent {
            match self
                .active_requests
                .compare_exchange(active, active + 1, Relaxed, Relaxed)
            {
                Ok(_) => return true,
                Err(current) => active = current,
            }
        }
        false
    }

    async fn invoke_with_retry(&self, task: &GenerationTask) -> Result<GeneratedConversation, String> {
        let mut attempt = 0;
        loop {
            match self.provider.generate(task).await {
                Ok(conversation) => return Ok(conversation),
                Err(error) if error.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!("Transient provider error (attempt {}): {}", attempt, error);
                    sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                Err(error) => return Err(error.to_string()),
            }
        }
    }

    /// Synchronous single-step path used by batch stepping: admit one of
    /// the job's queued items through rate and concurrency control, invoke
    /// the provider, and report the outcome. Returns None when the job has
    /// no claimable item in the queue.
    pub async fn execute_for_job(&self, job_id: Uuid) -> Option<ItemOutcome> {
        while self.is_paused() {
            sleep(Duration::from_millis(100)).await;
        }

        // Local backoff is not an error: the item stays pending while we
        // wait out the window.
        loop {
            let status = self.rate_limiter.status();
            if status.current_count < status.limit {
                break;
            }
            let wait = Duration::from_millis(status.estimated_wait_ms.max(50));
            tracing::debug!("Rate window saturated, deferring {}ms", wait.as_millis());
            sleep(wait).await;
        }

        // Acquire a concurrency slot.
        while !self.try_acquire_slot() {
            sleep(Duration::from_millis(50)).await;
        }

        let claimed = self
            .queue
            .dequeue_where(|item| item.payload.job_id == Some(job_id));

        let Some(item) = claimed else {
            self.active_requests.fetch_sub(1, Relaxed);
            return None;
        };

        self.rate_limiter.add_request(item.id.clone());
        let outcome = match self.invoke_with_retry(&item.payload).await {
            Ok(conversation) => {
                self.queue.mark_completed(&item.id);
                ItemOutcome {
                    item_id: item.id,
                    conversation: Some(conversation),
                    error: None,
                }
            }
            Err(error) => {
                self.queue.mark_failed(&item.id, Some(error.clone()));
                ItemOutcome {
                    item_id: item.id,
                    conversation: None,
                    error: Some(error),
                }
            }
        };

        self.active_requests.fetch_sub(1, Relaxed);
        Some(outcome)
    }

    /// Suspend new dispatches for the given duration. In-flight requests
    /// are unaffected; the flag clears itself once the deadline passes.
    pub fn pause(&self, duration: Duration) {
        *self.pause_until.lock().unwrap() = Some(Instant::now() + duration);
        tracing::info!("Processor paused for {}ms", duration.as_millis());
    }

    pub fn resume(&self) {
        *self.pause_until.lock().unwrap() = None;
    }

    pub fn is_paused(&self) -> bool {
        let mut guard = self.pause_until.lock().unwrap();
        match *guard {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *guard = None;
                false
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }

    pub fn status(&self) -> ProcessorStatus {
        let pause_until = {
            let guard = self.pause_until.lock().unwrap();
            guard.and_then(|until| {
                let remaining = until.checked_duration_since(Instant::now())?;
                Some(chrono::Utc::now().timestamp_millis() + remaining.as_millis() as i64)
            })
        };

        ProcessorStatus {
            is_paused: self.is_paused(),
            pause_until,
            active_requests: self.active_requests.load(Relaxed),
            max_concurrent: self.config.max_concurrent,
        }
    }

    pub fn config(&self) -> ProcessorConfig {
        self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
