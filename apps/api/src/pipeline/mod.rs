pub mod job;
pub mod orchestrator;
pub mod stages;

pub use job::JobId;
pub use orchestrator::Orchestrator;
pub use stages::{JobInput, LlmPipeline, PipelineStages};
