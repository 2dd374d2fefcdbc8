use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use http::HeaderValue;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::ServerState;

use super::handlers::{generate, jobs, status};

pub struct AppRouter;

impl AppRouter {
    pub fn create(state: ServerState) -> Router {
        let origins = ["https://localhost:3000", "http://localhost:3000"]
            .into_iter()
            .map(|origin| origin.parse::<HeaderValue>().unwrap())
            .collect::<Vec<_>>();

        let cors_layer = CorsLayer::new()
            .allow_origin(origins)
            .allow_credentials(true);

        Router::new()
            .route("/", get(|| async { "Dispatch server" }))
            .route("/queue/status", get(status::get_queue_status))
            .route("/generate", post(generate::enqueue_generation))
            .nest(
                "/batch-jobs",
                Router::new()
                    .route("/", post(jobs::create_job).get(jobs::list_jobs))
                    .route("/:id", get(jobs::get_job).patch(jobs::control_job))
                    .route("/:id/process-next", post(jobs::process_next))
                    .with_state(state.clone()),
            )
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer)
            .with_state(state)
            .fallback(handler_404)
    }
}

pub async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Route does not exist")
}
