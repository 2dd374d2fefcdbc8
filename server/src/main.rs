#![allow(dead_code)]

mod error;
mod generation;
mod jobs;
mod observability;
mod queue;
mod rate_limiter;
mod routes;
mod server_config;
#[cfg(test)]
mod testing;

use std::{env, net::SocketAddr, sync::Arc};

use axum::{extract::FromRef, Router};
use mimalloc::MiMalloc;
use tokio::{signal, task::JoinHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use generation::provider::{GenerationProvider, HttpProvider};
use jobs::runner_map::JobRunnerMap;
use jobs::store::{InMemoryJobStore, SharedJobStore};
use observability::QueueStatusReporter;
use queue::{QueueProcessor, RequestQueue};
use rate_limiter::RateLimiter;
use routes::AppRouter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

/// Composition root: every service is constructed here and handed to its
/// consumers by reference. No module-level singletons; tests build their
/// own instances.
#[derive(Clone, FromRef)]
pub struct ServerState {
    pub http_client: HttpClient,
    pub rate_limiter: RateLimiter,
    pub request_queue: RequestQueue,
    pub processor: QueueProcessor,
    pub job_store: SharedJobStore,
    pub runner_map: JobRunnerMap,
    pub reporter: QueueStatusReporter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;

    let provider: Arc<dyn GenerationProvider> = Arc::new(HttpProvider::new(
        http_client.clone(),
        server_config::cfg.api.clone(),
        server_config::cfg.model.clone(),
    ));

    let rate_limiter = RateLimiter::new(server_config::cfg.rate_limit);
    let request_queue = RequestQueue::new();
    let processor = QueueProcessor::new(
        server_config::cfg.queue,
        request_queue.clone(),
        rate_limiter.clone(),
        provider,
    );
    let job_store: SharedJobStore = Arc::new(InMemoryJobStore::new());
    let runner_map = JobRunnerMap::new(
        job_store.clone(),
        request_queue.clone(),
        processor.clone(),
        server_config::cfg.batch,
    );
    let reporter = QueueStatusReporter::new(
        rate_limiter.clone(),
        request_queue.clone(),
        processor.clone(),
    );

    let state = ServerState {
        http_client,
        rate_limiter,
        request_queue,
        processor: processor.clone(),
        job_store,
        runner_map: runner_map.clone(),
        reporter: reporter.clone(),
    };

    processor.start();
    let watch_handle = observability::watch(reporter, runner_map);

    let router = AppRouter::create(state);
    let server_handle = run_server(router, processor);

    tokio::select! {
        _ = server_handle => {
            tracing::info!("Server shut down, exiting");
        }
        _ = watch_handle => {
            tracing::info!("Status watch ended");
        }
    }

    Ok(())
}

async fn shutdown_signal(processor: QueueProcessor) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            processor.stop();
            tracing::info!("Dispatch stopped, shutting down");
        },
        _ = terminate => {
            processor.stop();
            tracing::info!("Dispatch stopped, shutting down");
        },
    }
}

fn run_server(router: Router, processor: QueueProcessor) -> JoinHandle<()> {
    tokio::spawn(async {
        let port = env::var("PORT").unwrap_or("5006".to_string());
        tracing::info!("Dispatch server running on http://0.0.0.0:{}", port);
        println!("{}", *server_config::cfg);

        let addr = SocketAddr::from(([0, 0, 0, 0], port.parse::<u16>().unwrap()));
        tracing::debug!("listening on {addr}");
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(processor))
        .await
        .unwrap();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::extract::{Path, State};
    use axum::Json;

    use crate::jobs::orchestrator::StepStatus;
    use crate::jobs::JobStatus;
    use crate::routes::handlers::jobs as job_handlers;
    use crate::routes::handlers::jobs::{ControlRequest, CreateJobItem, CreateJobRequest, JobAction};
    use crate::testing::common::{
        test_orchestrator_config, test_processor_config, test_rate_limit_config, StubProvider,
    };

    fn test_state(provider: Arc<dyn GenerationProvider>) -> ServerState {
        let http_client = reqwest::Client::new();
        let rate_limiter = RateLimiter::new(test_rate_limit_config());
        let request_queue = RequestQueue::new();
        let processor = QueueProcessor::new(
            test_processor_config(),
            request_queue.clone(),
            rate_limiter.clone(),
            provider,
        );
        let job_store: SharedJobStore = Arc::new(InMemoryJobStore::new());
        let runner_map = JobRunnerMap::new(
            job_store.clone(),
            request_queue.clone(),
            processor.clone(),
            test_orchestrator_config(),
        );
        let reporter = QueueStatusReporter::new(
            rate_limiter.clone(),
            request_queue.clone(),
            processor.clone(),
        );

        ServerState {
            http_client,
            rate_limiter,
            request_queue,
            processor,
            job_store,
            runner_map,
            reporter,
        }
    }

    fn request(topics: &[&str]) -> CreateJobRequest {
        CreateJobRequest {
            name: Some("handler test".to_string()),
            priority: None,
            items: topics
                .iter()
                .map(|topic| CreateJobItem {
                    topic: topic.to_string(),
                    tier: None,
                    parameters: serde_json::Value::Null,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn job_lifecycle_over_the_handler_surface() {
        let provider = Arc::new(StubProvider::with_delay(Duration::ZERO));
        let state = test_state(provider);

        let Json(job) = job_handlers::create_job(State(state.clone()), Json(request(&["a", "b"])))
            .await
            .unwrap();
        assert_eq!(job.progress.total, 2);

        // The auto-started runner drives the job to completion.
        let mut status = job.status;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let Json(view) = job_handlers::get_job(State(state.clone()), Path(job.job_id))
                .await
                .unwrap();
            status = view.status;
            if status == JobStatus::Completed {
                assert_eq!(view.progress.successful, 2);
                break;
            }
        }
        assert_eq!(status, JobStatus::Completed);

        // Stepping a completed job only reports the terminal state.
        let Json(step) = job_handlers::process_next(State(state.clone()), Path(job.job_id))
            .await
            .unwrap();
        assert_eq!(step.status, StepStatus::JobCompleted);

        let snapshot = state.reporter.snapshot();
        assert_eq!(snapshot.total_processed, 2);
        assert_eq!(snapshot.queue_size, 0);
    }

    #[tokio::test]
    async fn cancelled_job_skips_remaining_items() {
        let provider = Arc::new(StubProvider::with_delay(Duration::from_millis(100)));
        let state = test_state(provider);

        let Json(job) =
            job_handlers::create_job(State(state.clone()), Json(request(&["a", "b", "c"])))
                .await
                .unwrap();

        // First item is mid-flight; cancel takes effect before the second.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let Json(view) = job_handlers::control_job(
            State(state.clone()),
            Path(job.job_id),
            Json(ControlRequest {
                action: JobAction::Cancel,
            }),
        )
        .await
        .unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let Json(view) = job_handlers::get_job(State(state.clone()), Path(job.job_id))
            .await
            .unwrap();
        assert_eq!(view.status, JobStatus::Cancelled);
        assert!(view.progress.completed <= 1);

        let Json(step) = job_handlers::process_next(State(state.clone()), Path(job.job_id))
            .await
            .unwrap();
        assert_eq!(step.status, StepStatus::JobCancelled);

        // Cancelling again is rejected as a conflict.
        let result = job_handlers::control_job(
            State(state.clone()),
            Path(job.job_id),
            Json(ControlRequest {
                action: JobAction::Cancel,
            }),
        )
        .await;
        assert!(result.is_err());
    }
}
