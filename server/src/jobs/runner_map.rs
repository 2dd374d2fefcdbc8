use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::queue::{QueueProcessor, RequestQueue};

use super::orchestrator::{BatchJobOrchestrator, OrchestratorConfig};
use super::store::SharedJobStore;

/// Owns at most one stepping loop per job. A job observed in queued state
/// gets a loop exactly once; repeated observations while a loop is active
/// are no-ops.
#[derive(Clone)]
pub struct JobRunnerMap {
    store: SharedJobStore,
    queue: RequestQueue,
    processor: QueueProcessor,
    config: OrchestratorConfig,
    runners: Arc<RwLock<HashMap<Uuid, Arc<BatchJobOrchestrator>>>>,
}

impl JobRunnerMap {
    pub fn new(
        store: SharedJobStore,
        queue: RequestQueue,
        processor: QueueProcessor,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            queue,
            processor,
            config,
            runners: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a stepping loop for the job unless one is already active.
    pub fn ensure_running(&self, job_id: Uuid) {
        if let Some(runner) = self.runners.read().unwrap().get(&job_id) {
            if runner.is_running() {
                return;
            }
        }

        let mut runners = self.runners.write().unwrap();
        // Re-check under the write lock so concurrent observers cannot
        // both install a runner.
        if let Some(runner) = runners.get(&job_id) {
            if runner.is_running() {
                return;
            }
        }

        tracing::info!("Starting runner for job {}", job_id);
        let runner = BatchJobOrchestrator::new(
            job_id,
            self.store.clone(),
            self.queue.clone(),
            self.processor.clone(),
            self.config,
        );
        runners.insert(job_id, runner.clone());
        runner.start_processing();
    }

    pub fn stop(&self, job_id: Uuid) {
        if let Some(runner) = self.runners.read().unwrap().get(&job_id) {
            tracing::info!("Stopping runner for job {}", job_id);
            runner.stop_processing();
        }
    }

    /// Drop runners whose loops have finished.
    pub fn cleanup_finished(&self) {
        self.runners
            .write()
            .unwrap()
            .retain(|_, runner| runner.is_running());
    }

    pub fn active_count(&self) -> usize {
        self.runners
            .read()
            .unwrap()
            .values()
            .filter(|runner| runner.is_running())
            .count()
    }
}
