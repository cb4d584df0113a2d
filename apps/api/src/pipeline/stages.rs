//! The stage seam. The orchestrator only sees `Arc<dyn PipelineStages>`, so stage
//! implementations can be swapped without touching job tracking.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::generation::analyze::{analyze_fit, Analysis};
use crate::generation::extract::{extract_posting, ExtractedPosting};
use crate::generation::generate::{generate_content, GeneratedContent};
use crate::generation::render::render_documents;
use crate::llm_client::InferenceClient;
use crate::models::profile::UserProfile;
use crate::pipeline::job::{JobId, JobResult, StageError};
use crate::storage::ArtifactStore;

/// Everything a job needs to run.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub posting_text: String,
    pub profile: UserProfile,
}

#[async_trait]
pub trait PipelineStages: Send + Sync {
    async fn extract(
        &self,
        posting_text: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractedPosting, StageError>;

    async fn analyze(
        &self,
        posting: ExtractedPosting,
        profile: &UserProfile,
        cancel: &CancellationToken,
    ) -> Result<Analysis, StageError>;

    async fn generate(
        &self,
        analysis: &Analysis,
        cancel: &CancellationToken,
    ) -> Result<GeneratedContent, StageError>;

    async fn render(
        &self,
        job_id: &JobId,
        analysis: &Analysis,
        content: &GeneratedContent,
        cancel: &CancellationToken,
    ) -> Result<JobResult, StageError>;
}

/// Production stages backed by the inference client and an artifact store.
pub struct LlmPipeline {
    client: Arc<InferenceClient>,
    store: Arc<dyn ArtifactStore>,
    llm_scoring: bool,
}

impl LlmPipeline {
    pub fn new(client: Arc<InferenceClient>, store: Arc<dyn ArtifactStore>, llm_scoring: bool) -> Self {
        Self {
            client,
            store,
            llm_scoring,
        }
    }
}

#[async_trait]
impl PipelineStages for LlmPipeline {
    async fn extract(
        &self,
        posting_text: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtractedPosting, StageError> {
        extract_posting(&self.client, posting_text, cancel).await
    }

    async fn analyze(
        &self,
        posting: ExtractedPosting,
        profile: &UserProfile,
        cancel: &CancellationToken,
    ) -> Result<Analysis, StageError> {
        analyze_fit(&self.client, posting, profile, self.llm_scoring, cancel).await
    }

    async fn generate(
        &self,
        analysis: &Analysis,
        cancel: &CancellationToken,
    ) -> Result<GeneratedContent, StageError> {
        generate_content(&self.client, analysis, cancel).await
    }

    async fn render(
        &self,
        job_id: &JobId,
        analysis: &Analysis,
        content: &GeneratedContent,
        _cancel: &CancellationToken,
    ) -> Result<JobResult, StageError> {
        render_documents(self.store.as_ref(), job_id, analysis, content).await
    }
}
