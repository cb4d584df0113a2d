// Stage executors: Extract → Analyze → Generate → Render.
// Model calls go through llm_client::InferenceClient only; Render makes none.

pub mod analyze;
pub mod extract;
pub mod generate;
pub mod prompts;
pub mod render;
