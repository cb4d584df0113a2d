use std::sync::Arc;

use crate::cache::InferenceCache;
use crate::metrics::MetricsRecorder;
use crate::pipeline::Orchestrator;
use crate::profile::ProfileSource;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Profile lookup for job submission. Default: `PgProfileSource`.
    pub profiles: Arc<dyn ProfileSource>,
    pub metrics: Arc<MetricsRecorder>,
    pub cache: Arc<InferenceCache>,
}
