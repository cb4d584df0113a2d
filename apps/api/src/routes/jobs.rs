use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::pipeline::job::{Job, JobStatus};
use crate::pipeline::{JobId, JobInput};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub user_id: Uuid,
    pub posting_text: String,
}

#[derive(Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// POST /api/v1/jobs
/// Loads the user's profile, then hands the job to the orchestrator and returns at once.
pub async fn handle_submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), AppError> {
    if req.posting_text.trim().is_empty() {
        return Err(AppError::Validation("posting_text must not be empty".to_string()));
    }

    let profile = state.profiles.load(req.user_id).await?;
    if profile.entries.is_empty() {
        return Err(AppError::NotFound(format!(
            "No profile entries for user {}",
            req.user_id
        )));
    }

    let job_id = state.orchestrator.submit(JobInput {
        posting_text: req.posting_text,
        profile,
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}

/// GET /api/v1/jobs/:id
pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let id = JobId::from(id);
    state
        .orchestrator
        .get_status(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job {id} not found")))
}

/// GET /api/v1/jobs
pub async fn handle_list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.orchestrator.list_jobs())
}
