// Cross-cutting prompt fragments shared by every stage that calls the model.
// Stage-specific templates live in generation::prompts.

/// Appended to every stage system prompt. Local models drift into prose without it.
pub const JSON_ONLY_INSTRUCTION: &str = "You MUST respond with a single valid JSON value only. \
    Do NOT include any text outside the JSON. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Every generated claim must trace back to a profile entry.
pub const GROUNDING_INSTRUCTION: &str = "\
    CRITICAL: Every claim you generate must be traceable to a specific profile entry \
    provided below. Do NOT infer, interpolate, or invent details. \
    If the profile does not support a claim, omit it entirely. \
    Tag every output bullet with its source `entry_id`.";

/// Keeps ownership language honest relative to the entry's contribution type.
pub const SCOPE_INSTRUCTION: &str = "\
    CRITICAL: Map contribution_type to language precisely: \
    - sole_author / primary_contributor: may use 'Architected', 'Designed', 'Built', 'Led' \
    - team_member: must use 'Contributed to', 'Collaborated on', 'Implemented (as part of team)' \
    - reviewer: must use 'Reviewed', 'Evaluated', 'Assessed' \
    NEVER upgrade a team_member to solo language.";

/// Joins a stage persona with the JSON-only rule.
pub fn json_system(persona: &str) -> String {
    format!("{persona} {JSON_ONLY_INSTRUCTION}")
}
