//! Analyze stage: matches profile entries against the extracted posting.
//!
//! 1. Keyword fit report (deterministic): per keyword, best evidence across entries.
//! 2. Content selection: rank entries by recency, impact and keyword relevance, then
//!    apply per-section limits.
//! 3. Optional model assessment of the selected entries, blended with the keyword score.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::generation::extract::{ExtractedPosting, PostingTone};
use crate::generation::prompts::{FIT_PERSONA, FIT_PROMPT_TEMPLATE};
use crate::llm_client::prompts::json_system;
use crate::llm_client::{GenerateOptions, InferenceClient, StructuredOutput};
use crate::models::profile::{ProfileEntryRow, UserProfile};
use crate::pipeline::job::{Stage, StageError};

pub const MODULE: &str = "analyze";

const TAG_MATCH_STRENGTH: f32 = 1.0;
const TEXT_MATCH_STRENGTH: f32 = 0.6;
const STRONG_THRESHOLD: f32 = 0.8;
const PARTIAL_THRESHOLD: f32 = 0.4;

/// Weight of the model's score when blended with the keyword score.
const LLM_SCORE_WEIGHT: f64 = 0.4;

const EXPERIENCE_LIMIT: usize = 8;
const PROJECT_LIMIT: usize = 4;
const OTHER_LIMIT: usize = 3;

/// Entries sent to the model for assessment.
const ASSESSMENT_ENTRY_LIMIT: usize = 10;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitMatch {
    pub keyword: String,
    pub evidence_entry_id: Uuid,
    pub strength: f32,
}

/// A posting keyword no entry covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub keyword: String,
    pub frequency: u32,
    /// Entry whose tags partially overlap the keyword, if any.
    pub nearest_entry_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    /// 0–100
    pub keyword_score: u32,
    pub strong_matches: Vec<FitMatch>,
    pub partial_matches: Vec<FitMatch>,
    pub gaps: Vec<Gap>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingWeights {
    pub recency: f64,
    pub impact: f64,
    pub relevance: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            recency: 0.5,
            impact: 0.3,
            relevance: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub entry: ProfileEntryRow,
    pub combined_score: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedEntry {
    pub entry_id: Uuid,
    pub reason: String,
}

/// Model judgement of the candidate, produced when model scoring is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitAssessment {
    pub score: u32,
    pub rationale: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
}

impl StructuredOutput for FitAssessment {
    fn validate(&self) -> Result<(), String> {
        if self.score > 100 {
            return Err(format!("score {} is above 100", self.score));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub posting: ExtractedPosting,
    pub fit_report: FitReport,
    pub selected: Vec<RankedEntry>,
    pub excluded: Vec<ExcludedEntry>,
    pub section_weights: BTreeMap<String, f32>,
    pub assessment: Option<FitAssessment>,
    /// Final 0–100 fit score.
    pub score: u32,
}

// ────────────────────────────────────────────────────────────────────────────
// Stage entry point
// ────────────────────────────────────────────────────────────────────────────

pub async fn analyze_fit(
    client: &InferenceClient,
    posting: ExtractedPosting,
    profile: &UserProfile,
    llm_scoring: bool,
    cancel: &CancellationToken,
) -> Result<Analysis, StageError> {
    if profile.entries.is_empty() {
        return Err(StageError::validation(
            Stage::Analyze,
            format!("user {} has no profile entries", profile.user_id),
        ));
    }

    let fit_report = keyword_fit(&profile.entries, &posting);
    let (selected, excluded) = select_entries(&profile.entries, &posting, &RankingWeights::default());
    if selected.is_empty() {
        return Err(StageError::validation(
            Stage::Analyze,
            "no profile entries survived selection",
        ));
    }
    info!(
        "Keyword fit {}/100; selected {} of {} entries",
        fit_report.keyword_score,
        selected.len(),
        profile.entries.len()
    );

    let assessment = if llm_scoring {
        Some(assess_fit(client, &posting, &selected, fit_report.keyword_score, cancel).await?)
    } else {
        None
    };
    let score = blend_scores(fit_report.keyword_score, assessment.as_ref().map(|a| a.score));

    Ok(Analysis {
        section_weights: section_weights(posting.detected_tone),
        posting,
        fit_report,
        selected,
        excluded,
        assessment,
        score,
    })
}

async fn assess_fit(
    client: &InferenceClient,
    posting: &ExtractedPosting,
    selected: &[RankedEntry],
    keyword_score: u32,
    cancel: &CancellationToken,
) -> Result<FitAssessment, StageError> {
    let posting_json = serde_json::to_string_pretty(&serde_json::json!({
        "title": posting.title,
        "seniority": posting.seniority,
        "hard_requirements": posting.hard_requirements,
        "soft_signals": posting.soft_signals,
    }))
    .map_err(|e| StageError::validation(Stage::Analyze, format!("serialize posting: {e}")))?;

    let entries_json = serde_json::to_string_pretty(
        &selected
            .iter()
            .take(ASSESSMENT_ENTRY_LIMIT)
            .map(|r| {
                serde_json::json!({
                    "heading": r.entry.heading(),
                    "entry_type": r.entry.entry_type,
                    "tags": r.entry.tags,
                    "summary": r.entry.raw_text,
                })
            })
            .collect::<Vec<_>>(),
    )
    .map_err(|e| StageError::validation(Stage::Analyze, format!("serialize entries: {e}")))?;

    let prompt = FIT_PROMPT_TEMPLATE
        .replace("{posting_json}", &posting_json)
        .replace("{entries_json}", &entries_json)
        .replace("{keyword_score}", &keyword_score.to_string());

    let assessment = client
        .generate_structured::<FitAssessment>(
            &prompt,
            &json_system(FIT_PERSONA),
            MODULE,
            &GenerateOptions::json(),
            cancel,
        )
        .await
        .map_err(|e| StageError::new(Stage::Analyze, e))?;
    info!("Model fit assessment: {}/100", assessment.score);
    Ok(assessment)
}

fn blend_scores(keyword_score: u32, llm_score: Option<u32>) -> u32 {
    match llm_score {
        Some(llm) => {
            let blended =
                keyword_score as f64 * (1.0 - LLM_SCORE_WEIGHT) + llm as f64 * LLM_SCORE_WEIGHT;
            blended.round().clamp(0.0, 100.0) as u32
        }
        None => keyword_score,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Keyword fit
// ────────────────────────────────────────────────────────────────────────────

/// Strength of the best evidence one entry offers for a lowercase keyword.
fn match_strength(entry: &ProfileEntryRow, keyword: &str, text: &str) -> f32 {
    if entry.tags.iter().any(|t| t.to_lowercase() == keyword) {
        TAG_MATCH_STRENGTH
    } else if text.contains(keyword) {
        TEXT_MATCH_STRENGTH
    } else {
        0.0
    }
}

/// score = Σ(strength × weighted_score) / Σ(weighted_score) × 100
fn keyword_fit(entries: &[ProfileEntryRow], posting: &ExtractedPosting) -> FitReport {
    let texts: Vec<String> = entries.iter().map(ProfileEntryRow::searchable_text).collect();

    let mut strong_matches = Vec::new();
    let mut partial_matches = Vec::new();
    let mut gaps = Vec::new();
    let mut total_weight = 0.0_f32;
    let mut matched_weight = 0.0_f32;

    for kw in &posting.keyword_inventory {
        let keyword = kw.keyword.to_lowercase();
        total_weight += kw.weighted_score;

        let best = entries
            .iter()
            .zip(&texts)
            .map(|(entry, text)| (entry.entry_id, match_strength(entry, &keyword, text)))
            .filter(|(_, s)| *s > 0.0)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        match best {
            Some((entry_id, strength)) => {
                matched_weight += strength * kw.weighted_score;
                let fit_match = FitMatch {
                    keyword: kw.keyword.clone(),
                    evidence_entry_id: entry_id,
                    strength,
                };
                if strength >= STRONG_THRESHOLD {
                    strong_matches.push(fit_match);
                } else if strength >= PARTIAL_THRESHOLD {
                    partial_matches.push(fit_match);
                }
            }
            None => gaps.push(Gap {
                keyword: kw.keyword.clone(),
                frequency: kw.frequency,
                nearest_entry_id: nearest_entry(entries, &keyword),
            }),
        }
    }

    let keyword_score = if total_weight > 0.0 {
        ((matched_weight / total_weight) * 100.0).round().clamp(0.0, 100.0) as u32
    } else {
        0
    };

    FitReport {
        recommendation: recommendation(keyword_score, &gaps),
        keyword_score,
        strong_matches,
        partial_matches,
        gaps,
    }
}

fn nearest_entry(entries: &[ProfileEntryRow], keyword: &str) -> Option<Uuid> {
    entries
        .iter()
        .find(|e| {
            e.tags.iter().any(|t| {
                let t = t.to_lowercase();
                t.contains(keyword) || keyword.contains(&t)
            })
        })
        .map(|e| e.entry_id)
}

fn recommendation(score: u32, gaps: &[Gap]) -> String {
    let top_gaps: Vec<&str> = gaps.iter().take(3).map(|g| g.keyword.as_str()).collect();
    if score >= 80 {
        "Strong fit. The profile directly covers the key requirements.".to_string()
    } else if score >= 60 {
        format!("Moderate fit ({score}/100). Missing evidence for: {}.", top_gaps.join(", "))
    } else {
        format!(
            "Low fit ({score}/100). Significant gaps: {}.",
            top_gaps.join(", ")
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Content selection
// ────────────────────────────────────────────────────────────────────────────

/// Share of the posting's keyword weight an entry touches (tag or text), 0.0–1.0.
fn relevance(entry: &ProfileEntryRow, text: &str, posting: &ExtractedPosting) -> f64 {
    let total: f32 = posting.keyword_inventory.iter().map(|k| k.weighted_score).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let matched: f32 = posting
        .keyword_inventory
        .iter()
        .filter(|k| match_strength(entry, &k.keyword.to_lowercase(), text) > 0.0)
        .map(|k| k.weighted_score)
        .sum();
    (matched / total) as f64
}

fn combined_score(entry: &ProfileEntryRow, relevance: f64, weights: &RankingWeights) -> f64 {
    (weights.recency * entry.recency_score
        + weights.impact * entry.impact_score
        + weights.relevance * relevance)
        .clamp(0.0, 1.0)
}

fn section_limit(entry_type: &str) -> usize {
    match entry_type {
        "experience" => EXPERIENCE_LIMIT,
        "project" | "open_source" => PROJECT_LIMIT,
        _ => OTHER_LIMIT,
    }
}

/// Ranks all entries (highest combined score first, ties by entry id) and keeps
/// at most `section_limit` per section.
fn select_entries(
    entries: &[ProfileEntryRow],
    posting: &ExtractedPosting,
    weights: &RankingWeights,
) -> (Vec<RankedEntry>, Vec<ExcludedEntry>) {
    let mut ranked: Vec<RankedEntry> = entries
        .iter()
        .map(|entry| {
            let relevance = relevance(entry, &entry.searchable_text(), posting);
            RankedEntry {
                combined_score: combined_score(entry, relevance, weights),
                relevance,
                entry: entry.clone(),
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.entry.entry_id.cmp(&b.entry.entry_id))
    });

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut selected = Vec::new();
    let mut excluded = Vec::new();
    for ranked_entry in ranked {
        let bucket = match ranked_entry.entry.entry_type.as_str() {
            "experience" => "experience",
            "project" | "open_source" => "project",
            _ => "other",
        };
        let limit = section_limit(&ranked_entry.entry.entry_type);
        let count = counts.entry(bucket).or_insert(0);
        if *count < limit {
            *count += 1;
            selected.push(ranked_entry);
        } else {
            excluded.push(ExcludedEntry {
                entry_id: ranked_entry.entry.entry_id,
                reason: format!(
                    "Section limit reached ({limit} max for {})",
                    ranked_entry.entry.entry_type
                ),
            });
        }
    }
    (selected, excluded)
}

/// Relative emphasis of each resume section for the detected tone.
fn section_weights(tone: PostingTone) -> BTreeMap<String, f32> {
    let mut weights: BTreeMap<String, f32> = [
        ("experience", 0.60),
        ("project", 0.20),
        ("education", 0.10),
        ("skill", 0.05),
        ("open_source", 0.05),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let adjustments: &[(&str, f32)] = match tone {
        PostingTone::ResearchOriented => &[("publication", 0.20), ("project", 0.10), ("experience", -0.10)],
        PostingTone::AggressiveStartup => &[("project", 0.15), ("open_source", 0.10), ("experience", -0.05)],
        PostingTone::CollaborativeEnterprise => &[("experience", 0.10)],
        PostingTone::ProductOriented => &[("project", 0.10), ("experience", 0.05)],
    };
    for (section, delta) in adjustments {
        *weights.entry(section.to_string()).or_insert(0.0) += delta;
    }
    weights
}
