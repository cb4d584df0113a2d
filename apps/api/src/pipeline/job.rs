//! Job record, stage identifiers and the failure taxonomy surfaced to pollers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::llm_client::{InferenceError, InferenceErrorKind};
use crate::storage::StoredArtifact;

/// Opaque job identifier, generated at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Analyze,
    Generate,
    Render,
}

impl Stage {
    /// Execution order.
    pub const ALL: [Stage; 4] = [Stage::Extract, Stage::Analyze, Stage::Generate, Stage::Render];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Analyze => "analyze",
            Self::Generate => "generate",
            Self::Render => "render",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub stage: Stage,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Output of a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub title: String,
    pub company: Option<String>,
    /// Fit score, 0–100.
    pub score: u32,
    pub summary: String,
    pub bullet_count: usize,
    pub output_files: Vec<StoredArtifact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    StageFailed,
    Timeout,
    BackendUnavailable,
    MalformedResponse,
    AllModelsExhausted,
    DeadlineExceeded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub current_step: Option<Stage>,
    pub steps: Vec<StepResult>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub error_kind: Option<JobErrorKind>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
}

impl Job {
    pub fn pending(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            current_step: None,
            steps: Vec::new(),
            result: None,
            error: None,
            error_kind: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            total_duration_ms: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Failures
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum StageFailure {
    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("artifact storage failed: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Error)]
#[error("{stage} stage failed: {cause}")]
pub struct StageError {
    pub stage: Stage,
    pub cause: StageFailure,
}

impl StageError {
    pub fn new(stage: Stage, cause: impl Into<StageFailure>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }

    pub fn validation(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, StageFailure::Validation(message.into()))
    }

    pub fn storage(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, StageFailure::Storage(message.into()))
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("job deadline of {}s exceeded during {stage} stage", deadline.as_secs_f64())]
    DeadlineExceeded { stage: Stage, deadline: Duration },

    #[error("job cancelled during {stage} stage")]
    Cancelled { stage: Stage },
}

impl JobFailure {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Stage(e) => e.stage,
            Self::DeadlineExceeded { stage, .. } | Self::Cancelled { stage } => *stage,
        }
    }

    pub fn kind(&self) -> JobErrorKind {
        match self {
            Self::DeadlineExceeded { .. } => JobErrorKind::DeadlineExceeded,
            Self::Cancelled { .. } => JobErrorKind::Cancelled,
            Self::Stage(StageError { cause, .. }) => match cause {
                StageFailure::Inference(e) => match e.kind() {
                    InferenceErrorKind::Timeout => JobErrorKind::Timeout,
                    InferenceErrorKind::BackendUnavailable => JobErrorKind::BackendUnavailable,
                    InferenceErrorKind::MalformedResponse => JobErrorKind::MalformedResponse,
                    InferenceErrorKind::AllModelsExhausted => JobErrorKind::AllModelsExhausted,
                    InferenceErrorKind::Cancelled => JobErrorKind::Cancelled,
                },
                StageFailure::Validation(_) | StageFailure::Storage(_) => JobErrorKind::StageFailed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_serializes_with_snake_case_enums() {
        let mut job = Job::pending(JobId::from("abc".to_string()));
        job.current_step = Some(Stage::Analyze);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["current_step"], "analyze");
        assert!(value["result"].is_null());
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let names: Vec<_> = Stage::ALL.iter().map(Stage::as_str).collect();
        assert_eq!(names, vec!["extract", "analyze", "generate", "render"]);
    }

    #[test]
    fn test_failure_kind_follows_inference_error() {
        let failure = JobFailure::from(StageError::new(
            Stage::Analyze,
            InferenceError::MalformedResponse("bad json".into()),
        ));
        assert_eq!(failure.kind(), JobErrorKind::MalformedResponse);
        assert_eq!(failure.stage(), Stage::Analyze);
        assert!(failure.to_string().contains("analyze stage failed"));
    }

    #[test]
    fn test_validation_failure_is_stage_failed() {
        let failure = JobFailure::from(StageError::validation(Stage::Extract, "empty posting"));
        assert_eq!(failure.kind(), JobErrorKind::StageFailed);
    }

    #[test]
    fn test_deadline_message_names_stage() {
        let failure = JobFailure::DeadlineExceeded {
            stage: Stage::Generate,
            deadline: Duration::from_secs(900),
        };
        assert_eq!(failure.kind(), JobErrorKind::DeadlineExceeded);
        assert_eq!(
            failure.to_string(),
            "job deadline of 900s exceeded during generate stage"
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
