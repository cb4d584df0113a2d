//! Generate stage: grounded resume bullets plus a summary and cover letter.
//!
//! Every bullet must cite a selected profile entry. Responses with unknown
//! citations are regenerated (bypassing the cache) up to MAX_GENERATION_RETRIES times.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::generation::analyze::Analysis;
use crate::generation::extract::PostingTone;
use crate::generation::prompts::{
    BULLETS_PERSONA, BULLETS_PROMPT_TEMPLATE, NARRATIVE_PERSONA, NARRATIVE_PROMPT_TEMPLATE,
};
use crate::llm_client::prompts::{json_system, GROUNDING_INSTRUCTION, SCOPE_INSTRUCTION};
use crate::llm_client::{GenerateOptions, InferenceClient, StructuredOutput};
use crate::pipeline::job::{Stage, StageError};

pub const MODULE: &str = "generate";

const MAX_GENERATION_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeBullet {
    pub text: String,
    pub source_entry_id: Uuid,
    pub section: String,
    #[serde(default)]
    pub jd_keywords_used: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BulletSet {
    bullets: Vec<ResumeBullet>,
}

impl StructuredOutput for BulletSet {
    fn validate(&self) -> Result<(), String> {
        if self.bullets.is_empty() {
            return Err("no bullets generated".to_string());
        }
        if self.bullets.iter().any(|b| b.text.trim().is_empty()) {
            return Err("bullet with empty text".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub summary: String,
    pub cover_letter: String,
}

impl StructuredOutput for Narrative {
    fn validate(&self) -> Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("summary is empty".to_string());
        }
        if self.cover_letter.trim().is_empty() {
            return Err("cover letter is empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub bullets: Vec<ResumeBullet>,
    pub summary: String,
    pub cover_letter: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Tone calibration
// ────────────────────────────────────────────────────────────────────────────

/// Verbs to lean on and verbs to avoid for a posting tone.
#[derive(Debug, Clone, Serialize)]
pub struct VerbGuide {
    pub preferred: Vec<&'static str>,
    pub avoid: Vec<&'static str>,
}

/// Verbs that claim sole ownership. Never offered for team_member or reviewer entries.
const SOLE_OWNER_VERBS: &[&str] = &["Architected", "Spearheaded", "Owned", "Drove", "Led", "Built"];
const REVIEWER_VERBS: &[&str] = &["Reviewed", "Evaluated", "Assessed", "Audited"];

pub fn verb_guide(tone: PostingTone) -> VerbGuide {
    let (preferred, avoid): (&[&'static str], &[&'static str]) = match tone {
        PostingTone::AggressiveStartup => (
            &["Architected", "Spearheaded", "Owned", "Drove", "Built", "Shipped", "Launched"],
            &["assisted", "helped", "participated in"],
        ),
        PostingTone::CollaborativeEnterprise => (
            &["Partnered with", "Contributed to", "Enabled", "Collaborated on", "Supported"],
            &["spearheaded", "solely built", "owned end-to-end"],
        ),
        PostingTone::ResearchOriented => (
            &["Investigated", "Designed and evaluated", "Published", "Proposed", "Analyzed"],
            &["shipped", "moved fast", "disrupted"],
        ),
        PostingTone::ProductOriented => (
            &["Shipped", "Delivered", "Launched", "Improved", "Reduced friction for"],
            &["investigated", "researched", "proposed"],
        ),
    };
    VerbGuide {
        preferred: preferred.to_vec(),
        avoid: avoid.to_vec(),
    }
}

/// Narrows preferred verbs to what the contribution type can honestly claim.
/// Unknown types are treated like team_member.
pub fn verbs_for_contribution(guide: &VerbGuide, contribution_type: &str) -> Vec<&'static str> {
    match contribution_type {
        "sole_author" | "primary_contributor" => guide.preferred.clone(),
        "reviewer" => REVIEWER_VERBS.to_vec(),
        _ => guide
            .preferred
            .iter()
            .copied()
            .filter(|v| !SOLE_OWNER_VERBS.iter().any(|s| s.eq_ignore_ascii_case(v)))
            .collect(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stage entry point
// ────────────────────────────────────────────────────────────────────────────

pub async fn generate_content(
    client: &InferenceClient,
    analysis: &Analysis,
    cancel: &CancellationToken,
) -> Result<GeneratedContent, StageError> {
    let bullets = generate_bullets(client, analysis, cancel).await?;
    let narrative = generate_narrative(client, analysis, &bullets, cancel).await?;
    info!(
        "Generated {} bullets, {}-char summary and {}-char cover letter",
        bullets.len(),
        narrative.summary.len(),
        narrative.cover_letter.len()
    );
    Ok(GeneratedContent {
        bullets,
        summary: narrative.summary.trim().to_string(),
        cover_letter: narrative.cover_letter.trim().to_string(),
    })
}

async fn generate_bullets(
    client: &InferenceClient,
    analysis: &Analysis,
    cancel: &CancellationToken,
) -> Result<Vec<ResumeBullet>, StageError> {
    let prompt = bullets_prompt(analysis)?;
    let system = json_system(BULLETS_PERSONA);
    let valid_ids: HashSet<Uuid> = analysis.selected.iter().map(|r| r.entry.entry_id).collect();

    for attempt in 0..=MAX_GENERATION_RETRIES {
        let options = GenerateOptions {
            bypass_cache: attempt > 0,
            ..GenerateOptions::json()
        };
        let set: BulletSet = client
            .generate_structured(&prompt, &system, MODULE, &options, cancel)
            .await
            .map_err(|e| StageError::new(Stage::Generate, e))?;

        let invalid = set
            .bullets
            .iter()
            .filter(|b| !valid_ids.contains(&b.source_entry_id))
            .count();
        if invalid == 0 {
            return Ok(set.bullets);
        }
        warn!(
            "Generation attempt {}/{}: {} bullets cite unknown entries, regenerating",
            attempt + 1,
            MAX_GENERATION_RETRIES + 1,
            invalid
        );
    }

    Err(StageError::validation(
        Stage::Generate,
        format!(
            "bullets cited unknown profile entries after {} attempts",
            MAX_GENERATION_RETRIES + 1
        ),
    ))
}

async fn generate_narrative(
    client: &InferenceClient,
    analysis: &Analysis,
    bullets: &[ResumeBullet],
    cancel: &CancellationToken,
) -> Result<Narrative, StageError> {
    let posting = &analysis.posting;
    let bullets_json = serde_json::to_string_pretty(
        &bullets.iter().map(|b| b.text.as_str()).collect::<Vec<_>>(),
    )
    .map_err(|e| StageError::validation(Stage::Generate, format!("serialize bullets: {e}")))?;
    let requirements = posting
        .hard_requirements
        .iter()
        .take(5)
        .map(|r| r.text.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    let prompt = NARRATIVE_PROMPT_TEMPLATE
        .replace("{title}", &posting.title)
        .replace("{company}", posting.company.as_deref().unwrap_or("the company"))
        .replace("{tone}", posting.detected_tone.label())
        .replace("{requirements}", &requirements)
        .replace("{bullets_json}", &bullets_json);

    client
        .generate_structured(
            &prompt,
            &json_system(NARRATIVE_PERSONA),
            MODULE,
            &GenerateOptions::json(),
            cancel,
        )
        .await
        .map_err(|e| StageError::new(Stage::Generate, e))
}

fn bullets_prompt(analysis: &Analysis) -> Result<String, StageError> {
    let posting = &analysis.posting;
    let guide = verb_guide(posting.detected_tone);

    let entries_json = serde_json::to_string_pretty(
        &analysis
            .selected
            .iter()
            .map(|r| {
                serde_json::json!({
                    "entry_id": r.entry.entry_id,
                    "entry_type": r.entry.entry_type,
                    "heading": r.entry.heading(),
                    "contribution_type": r.entry.contribution_type,
                    "allowed_verbs": verbs_for_contribution(&guide, &r.entry.contribution_type),
                    "tags": r.entry.tags,
                    "data": r.entry.data,
                    "raw_text": r.entry.raw_text,
                })
            })
            .collect::<Vec<_>>(),
    )
    .map_err(|e| StageError::validation(Stage::Generate, format!("serialize entries: {e}")))?;

    let keywords_json = serde_json::to_string(
        &posting
            .keyword_inventory
            .iter()
            .map(|k| &k.keyword)
            .collect::<Vec<_>>(),
    )
    .map_err(|e| StageError::validation(Stage::Generate, format!("serialize keywords: {e}")))?;

    let tone_json = serde_json::to_string(&guide)
        .map_err(|e| StageError::validation(Stage::Generate, format!("serialize tone: {e}")))?;

    let posting_summary = format!(
        "{} ({}), {} tone. Hard requirements: {}",
        posting.title,
        posting.seniority,
        posting.detected_tone.label(),
        posting
            .hard_requirements
            .iter()
            .take(5)
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    );

    Ok(BULLETS_PROMPT_TEMPLATE
        .replace("{grounding_instruction}", GROUNDING_INSTRUCTION)
        .replace("{scope_instruction}", SCOPE_INSTRUCTION)
        .replace("{tone_json}", &tone_json)
        .replace("{entries_json}", &entries_json)
        .replace("{keywords_json}", &keywords_json)
        .replace("{posting_summary}", &posting_summary))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use super::*;
    use crate::generation::analyze::{FitReport, RankedEntry};
    use crate::generation::extract::{ExtractedPosting, KeywordEntry, Requirement};
    use crate::models::profile::sample_entry;

    pub fn analysis() -> Analysis {
        let entry = sample_entry("experience", &["rust"], "Built a Rust cache");
        Analysis {
            posting: ExtractedPosting {
                title: "Rust Engineer".to_string(),
                company: Some("Ferrous Labs".to_string()),
                seniority: "senior".to_string(),
                hard_requirements: vec![Requirement {
                    text: "Rust".to_string(),
                    is_required: true,
                }],
                soft_signals: vec![],
                keyword_inventory: vec![KeywordEntry {
                    keyword: "Rust".to_string(),
                    frequency: 2,
                    position_weight: 1.0,
                    weighted_score: 2.0,
                }],
                detected_tone: PostingTone::AggressiveStartup,
            },
            fit_report: FitReport {
                keyword_score: 100,
                strong_matches: vec![],
                partial_matches: vec![],
                gaps: vec![],
                recommendation: "Strong fit.".to_string(),
            },
            selected: vec![RankedEntry {
                entry,
                combined_score: 0.9,
                relevance: 1.0,
            }],
            excluded: vec![],
            section_weights: BTreeMap::new(),
            assessment: None,
            score: 100,
        }
    }

    pub fn bullets_json(entry_id: Uuid) -> String {
        serde_json::json!({
            "bullets": [{
                "text": "Built a Rust cache serving 10k rps",
                "source_entry_id": entry_id,
                "section": "experience",
                "jd_keywords_used": ["Rust"]
            }]
        })
        .to_string()
    }

    pub const NARRATIVE_JSON: &str =
        r#"{"summary": "Rust engineer.", "cover_letter": "Dear team,\n\nI build caches."}"#;
}
