use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::generation::provider::{DispatchError, GenerationProvider};
use crate::generation::{GeneratedConversation, GenerationTask};
use crate::jobs::orchestrator::OrchestratorConfig;
use crate::queue::{ProcessorConfig, QueueProcessor, RequestQueue};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};

/// Simulated provider with controlled latency and failure modes. Records
/// call and concurrency counts so tests can assert on dispatch behavior.
pub struct StubProvider {
    delay: Duration,
    fail_topics: HashSet<String>,
    transient_failures: AtomicUsize,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl StubProvider {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            fail_topics: HashSet::new(),
            transient_failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Fail every call whose topic is in the given list.
    pub fn failing_on<const N: usize>(topics: [&str; N]) -> Self {
        let mut provider = Self::with_delay(Duration::ZERO);
        provider.fail_topics = topics.iter().map(|t| t.to_string()).collect();
        provider
    }

    /// Fail the first call with a transient error, then succeed.
    pub fn flaky_once() -> Self {
        let provider = Self::with_delay(Duration::ZERO);
        provider.transient_failures.store(1, Relaxed);
        provider
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Relaxed)
    }

    /// Highest number of generate calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Relaxed)
    }
}

#[async_trait]
impl GenerationProvider for StubProvider {
    async fn generate(
        &self,
        task: &GenerationTask,
    ) -> Result<GeneratedConversation, DispatchError> {
        self.calls.fetch_add(1, Relaxed);
        let active = self.active.fetch_add(1, Relaxed) + 1;
        self.peak.fetch_max(active, Relaxed);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Relaxed);

        if self
            .transient_failures
            .fetch_update(Relaxed, Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DispatchError::Transient("simulated 503".to_string()));
        }

        if self.fail_topics.contains(&task.topic) {
            return Err(DispatchError::Transient(format!(
                "simulated provider failure for {}",
                task.topic
            )));
        }

        Ok(GeneratedConversation {
            conversation_id: Uuid::new_v4(),
            content: format!("{{\"title\": \"{}\", \"turns\": []}}", task.topic),
            token_usage: 128,
        })
    }
}

pub fn test_rate_limit_config() -> RateLimitConfig {
    RateLimitConfig {
        request_limit: 1000,
        window_seconds: 60,
    }
}

pub fn test_processor_config() -> ProcessorConfig {
    ProcessorConfig {
        max_concurrent: 3,
        poll_interval_ms: 10,
        rate_limit_pause_ms: 100,
        max_retries: 0,
    }
}

pub fn test_orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        step_delay_ms: 10,
        max_iterations: 1000,
    }
}

/// Fresh queue + processor wired to the given provider. Each test owns its
/// own instances; nothing is shared or reset between tests.
pub fn test_processor(provider: Arc<dyn GenerationProvider>) -> (RequestQueue, QueueProcessor) {
    let queue = RequestQueue::new();
    let rate_limiter = RateLimiter::new(test_rate_limit_config());
    let processor = QueueProcessor::new(
        test_processor_config(),
        queue.clone(),
        rate_limiter,
        provider,
    );
    (queue, processor)
}
