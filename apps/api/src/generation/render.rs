//! Render stage: formats documents and writes them to the artifact store. No model calls.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::json;
use tracing::info;

use crate::generation::analyze::Analysis;
use crate::generation::generate::GeneratedContent;
use crate::pipeline::job::{JobId, JobResult, Stage, StageError};
use crate::storage::ArtifactStore;

const MARKDOWN: &str = "text/markdown; charset=utf-8";
const JSON: &str = "application/json";

pub async fn render_documents(
    store: &dyn ArtifactStore,
    job_id: &JobId,
    analysis: &Analysis,
    content: &GeneratedContent,
) -> Result<JobResult, StageError> {
    let resume = render_resume(analysis, content);
    let cover_letter = render_cover_letter(analysis, content);

    let mut output_files = Vec::with_capacity(3);
    for (name, body) in [("resume.md", resume), ("cover_letter.md", cover_letter)] {
        let artifact = store
            .put(&artifact_key(job_id, name), body.into_bytes(), MARKDOWN)
            .await
            .map_err(|e| StageError::storage(Stage::Render, e.to_string()))?;
        output_files.push(artifact);
    }

    let manifest = json!({
        "job_id": job_id,
        "title": analysis.posting.title,
        "company": analysis.posting.company,
        "score": analysis.score,
        "fit_report": analysis.fit_report,
        "assessment": analysis.assessment,
        "files": output_files,
    });
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| StageError::storage(Stage::Render, format!("serialize manifest: {e}")))?;
    let artifact = store
        .put(&artifact_key(job_id, "manifest.json"), manifest_bytes, JSON)
        .await
        .map_err(|e| StageError::storage(Stage::Render, e.to_string()))?;
    output_files.push(artifact);

    info!(
        "Rendered {} documents for job {} via {} store",
        output_files.len(),
        job_id,
        store.backend()
    );

    Ok(JobResult {
        title: analysis.posting.title.clone(),
        company: analysis.posting.company.clone(),
        score: analysis.score,
        summary: content.summary.clone(),
        bullet_count: content.bullets.len(),
        output_files,
    })
}

fn artifact_key(job_id: &JobId, name: &str) -> String {
    format!("jobs/{job_id}/{name}")
}

fn section_title(section: &str) -> String {
    match section {
        "experience" => "Experience".to_string(),
        "project" => "Projects".to_string(),
        "open_source" => "Open Source".to_string(),
        "education" => "Education".to_string(),
        "publication" => "Publications".to_string(),
        "skill" => "Skills".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>().replace('_', " "),
                None => "Other".to_string(),
            }
        }
    }
}

/// Markdown resume: summary, then sections ordered by tone weight, bullets grouped
/// under the entry they cite.
fn render_resume(analysis: &Analysis, content: &GeneratedContent) -> String {
    let posting = &analysis.posting;
    let mut out = String::new();
    let _ = writeln!(out, "# Resume — {}", posting.title);
    if let Some(company) = &posting.company {
        let _ = writeln!(out, "_Tailored for {company}_");
    }
    let _ = writeln!(out, "\n## Summary\n\n{}", content.summary);

    // section → entry heading → bullets, in selection order
    let mut sections: BTreeMap<&str, Vec<(String, Vec<&str>)>> = BTreeMap::new();
    for ranked in &analysis.selected {
        let entry_bullets: Vec<&str> = content
            .bullets
            .iter()
            .filter(|b| b.source_entry_id == ranked.entry.entry_id)
            .map(|b| b.text.as_str())
            .collect();
        if entry_bullets.is_empty() {
            continue;
        }
        sections
            .entry(ranked.entry.entry_type.as_str())
            .or_default()
            .push((ranked.entry.heading(), entry_bullets));
    }

    let mut ordered: Vec<_> = sections.into_iter().collect();
    ordered.sort_by(|(a, _), (b, _)| {
        let wa = analysis.section_weights.get(*a).copied().unwrap_or(0.0);
        let wb = analysis.section_weights.get(*b).copied().unwrap_or(0.0);
        wb.partial_cmp(&wa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });

    for (section, entries) in ordered {
        let _ = writeln!(out, "\n## {}", section_title(section));
        for (heading, bullets) in entries {
            let _ = writeln!(out, "\n### {heading}\n");
            for bullet in bullets {
                let _ = writeln!(out, "- {bullet}");
            }
        }
    }
    out
}

fn render_cover_letter(analysis: &Analysis, content: &GeneratedContent) -> String {
    let posting = &analysis.posting;
    let mut out = String::new();
    let _ = match &posting.company {
        Some(company) => writeln!(out, "# Cover Letter — {} at {company}\n", posting.title),
        None => writeln!(out, "# Cover Letter — {}\n", posting.title),
    };
    out.push_str(&content.cover_letter);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::generation::generate::fixtures::analysis;
    use crate::generation::generate::ResumeBullet;
    use crate::storage::LocalArtifactStore;

    fn content(entry_id: Uuid) -> GeneratedContent {
        GeneratedContent {
            bullets: vec![
                ResumeBullet {
                    text: "Built a Rust cache".to_string(),
                    source_entry_id: entry_id,
                    section: "experience".to_string(),
                    jd_keywords_used: vec![],
                },
                ResumeBullet {
                    text: "Orphan bullet".to_string(),
                    source_entry_id: Uuid::new_v4(),
                    section: "experience".to_string(),
                    jd_keywords_used: vec![],
                },
            ],
            summary: "Rust engineer.".to_string(),
            cover_letter: "Dear team,\n\nHello.".to_string(),
        }
    }

    #[test]
    fn test_resume_groups_bullets_under_entry_heading() {
        let analysis = analysis();
        let id = analysis.selected[0].entry.entry_id;
        let resume = render_resume(&analysis, &content(id));
        assert!(resume.starts_with("# Resume — Rust Engineer"));
        assert!(resume.contains("## Experience"));
        assert!(resume.contains("### Engineer, Acme"));
        assert!(resume.contains("- Built a Rust cache"));
        assert!(!resume.contains("Orphan bullet"));
    }

    #[test]
    fn test_section_title_fallback() {
        assert_eq!(section_title("volunteer_work"), "Volunteer work");
        assert_eq!(section_title("open_source"), "Open Source");
    }

    #[tokio::test]
    async fn test_render_writes_three_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let analysis = analysis();
        let id = analysis.selected[0].entry.entry_id;
        let job_id = JobId::from("job-1".to_string());

        let result = render_documents(&store, &job_id, &analysis, &content(id))
            .await
            .unwrap();

        let names: Vec<_> = result.output_files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["resume.md", "cover_letter.md", "manifest.json"]);
        assert_eq!(result.score, 100);
        assert_eq!(result.bullet_count, 2);

        let manifest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("jobs/job-1/manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["title"], "Rust Engineer");
        assert_eq!(manifest["files"].as_array().unwrap().len(), 2);
        let letter =
            std::fs::read_to_string(dir.path().join("jobs/job-1/cover_letter.md")).unwrap();
        assert!(letter.contains("Rust Engineer at Ferrous Labs"));
    }

    #[tokio::test]
    async fn test_storage_failure_is_render_stage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let store = LocalArtifactStore::new(&blocker);
        let analysis = analysis();
        let id = analysis.selected[0].entry.entry_id;

        let err = render_documents(&store, &JobId::generate(), &analysis, &content(id))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Render);
    }
}
