use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Latest version of one profile entry (a role, project, degree, skill group, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ProfileEntryRow {
    pub entry_id: Uuid,
    pub version: i32,
    /// experience | project | open_source | education | skill | publication
    pub entry_type: String,
    /// Structured fields as ingested: title, organization, start/end dates, highlights.
    pub data: Value,
    pub raw_text: Option<String>,
    pub recency_score: f64,
    pub impact_score: f64,
    pub tags: Vec<String>,
    /// sole_author | primary_contributor | team_member | reviewer
    pub contribution_type: String,
    pub created_at: DateTime<Utc>,
}

impl ProfileEntryRow {
    /// Human-readable heading, e.g. "Staff Engineer, Acme".
    pub fn heading(&self) -> String {
        let field = |name: &str| {
            self.data
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        let title = field("title").or_else(|| field("name"));
        let org = field("organization").or_else(|| field("company"));
        match (title, org) {
            (Some(t), Some(o)) => format!("{t}, {o}"),
            (Some(t), None) => t.to_string(),
            (None, Some(o)) => o.to_string(),
            (None, None) => self.entry_type.replace('_', " "),
        }
    }

    /// Free text used for keyword matching: raw text plus every string in `data`.
    pub fn searchable_text(&self) -> String {
        let mut text = self.raw_text.clone().unwrap_or_default();
        collect_strings(&self.data, &mut text);
        text.to_lowercase()
    }
}

fn collect_strings(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push(' ');
            out.push_str(s);
        }
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Everything the pipeline knows about the candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub entries: Vec<ProfileEntryRow>,
}

#[cfg(test)]
pub(crate) fn sample_entry(entry_type: &str, tags: &[&str], raw_text: &str) -> ProfileEntryRow {
    ProfileEntryRow {
        entry_id: Uuid::new_v4(),
        version: 1,
        entry_type: entry_type.to_string(),
        data: serde_json::json!({"title": "Engineer", "organization": "Acme"}),
        raw_text: Some(raw_text.to_string()),
        recency_score: 1.0,
        impact_score: 0.5,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        contribution_type: "primary_contributor".to_string(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_compare_by_value() {
        let entry = sample_entry("experience", &["rust"], "Built Rust services");
        assert_eq!(entry.clone(), entry);
        let newer = ProfileEntryRow {
            version: entry.version + 1,
            ..entry.clone()
        };
        assert_ne!(newer, entry);
    }

    #[test]
    fn test_heading_prefers_title_and_organization() {
        let entry = sample_entry("experience", &[], "");
        assert_eq!(entry.heading(), "Engineer, Acme");
    }

    #[test]
    fn test_heading_falls_back_to_entry_type() {
        let entry = ProfileEntryRow {
            data: json!({}),
            ..sample_entry("open_source", &[], "")
        };
        assert_eq!(entry.heading(), "open source");
    }

    #[test]
    fn test_searchable_text_includes_nested_data() {
        let entry = ProfileEntryRow {
            data: json!({"highlights": ["Cut Kafka lag by 80%"], "stack": {"db": "Postgres"}}),
            ..sample_entry("experience", &[], "Rust services")
        };
        let text = entry.searchable_text();
        assert!(text.contains("rust services"));
        assert!(text.contains("kafka"));
        assert!(text.contains("postgres"));
    }
}
