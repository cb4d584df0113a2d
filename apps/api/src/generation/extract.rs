//! Extract stage: turns a raw job posting into structured requirements, keywords and tone.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::generation::prompts::{EXTRACT_PERSONA, EXTRACT_PROMPT_TEMPLATE};
use crate::llm_client::prompts::json_system;
use crate::llm_client::{GenerateOptions, InferenceClient, InferenceError, StructuredOutput};
use crate::pipeline::job::{Stage, StageError};

pub const MODULE: &str = "extract";

/// One retry on a malformed structured response.
const MAX_EXTRACT_ATTEMPTS: u32 = 2;

/// Detected tone of a posting. Drives verb selection in the Generate stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingTone {
    AggressiveStartup,
    #[default]
    CollaborativeEnterprise,
    ResearchOriented,
    ProductOriented,
}

impl PostingTone {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AggressiveStartup => "fast-paced startup",
            Self::CollaborativeEnterprise => "collaborative enterprise",
            Self::ResearchOriented => "research-oriented",
            Self::ProductOriented => "product-focused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub text: String,
    pub is_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordEntry {
    pub keyword: String,
    pub frequency: u32,
    /// title=1.0, requirements=0.8, responsibilities=0.6, about=0.3
    pub position_weight: f32,
    /// frequency × position_weight, recomputed locally.
    #[serde(default)]
    pub weighted_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractedPosting {
    pub title: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default = "unknown_seniority")]
    pub seniority: String,
    #[serde(default)]
    pub hard_requirements: Vec<Requirement>,
    #[serde(default)]
    pub soft_signals: Vec<String>,
    pub keyword_inventory: Vec<KeywordEntry>,
    #[serde(default)]
    pub detected_tone: PostingTone,
}

fn unknown_seniority() -> String {
    "unknown".to_string()
}

impl StructuredOutput for ExtractedPosting {
    fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("posting title is empty".to_string());
        }
        if self.keyword_inventory.iter().all(|k| k.keyword.trim().is_empty()) {
            return Err("keyword inventory is empty".to_string());
        }
        if let Some(bad) = self
            .keyword_inventory
            .iter()
            .find(|k| !k.position_weight.is_finite() || !(0.0..=1.0).contains(&k.position_weight))
        {
            return Err(format!(
                "keyword '{}' has position_weight {} outside 0.0–1.0",
                bad.keyword, bad.position_weight
            ));
        }
        Ok(())
    }
}

impl ExtractedPosting {
    /// Trims fields, drops blank and duplicate keywords (case-insensitive, first wins)
    /// and recomputes every `weighted_score`.
    fn normalize(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.company = self
            .company
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        let mut seen = HashSet::new();
        self.keyword_inventory.retain_mut(|k| {
            k.keyword = k.keyword.trim().to_string();
            !k.keyword.is_empty() && seen.insert(k.keyword.to_lowercase())
        });
        for k in &mut self.keyword_inventory {
            k.weighted_score = k.frequency as f32 * k.position_weight;
        }
        self
    }
}

pub async fn extract_posting(
    client: &InferenceClient,
    posting_text: &str,
    cancel: &CancellationToken,
) -> Result<ExtractedPosting, StageError> {
    let posting_text = posting_text.trim();
    if posting_text.is_empty() {
        return Err(StageError::validation(Stage::Extract, "posting text is empty"));
    }

    let prompt = EXTRACT_PROMPT_TEMPLATE.replace("{posting_text}", posting_text);
    let system = json_system(EXTRACT_PERSONA);
    let options = GenerateOptions::json();

    let mut attempt = 1;
    loop {
        match client
            .generate_structured::<ExtractedPosting>(&prompt, &system, MODULE, &options, cancel)
            .await
        {
            Ok(posting) => {
                let posting = posting.normalize();
                info!(
                    "Extracted posting '{}' ({} keywords, tone={:?})",
                    posting.title,
                    posting.keyword_inventory.len(),
                    posting.detected_tone
                );
                return Ok(posting);
            }
            Err(InferenceError::MalformedResponse(reason)) if attempt < MAX_EXTRACT_ATTEMPTS => {
                warn!(
                    "Extract attempt {}/{} returned a malformed response ({reason}), retrying",
                    attempt, MAX_EXTRACT_ATTEMPTS
                );
                attempt += 1;
            }
            Err(e) => return Err(StageError::new(Stage::Extract, e)),
        }
    }
}
