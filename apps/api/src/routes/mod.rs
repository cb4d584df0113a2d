pub mod health;
pub mod jobs;
pub mod metrics;

use axum::{routing::get, Router};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Jobs
        .route(
            "/api/v1/jobs",
            get(jobs::handle_list_jobs).post(jobs::handle_submit_job),
        )
        .route("/api/v1/jobs/:id", get(jobs::handle_get_job))
        // Inference metrics
        .route(
            "/api/v1/metrics/summary",
            get(metrics::handle_metrics_summary),
        )
        .with_state(state)
}
