use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::generation::{analyze, extract, generate};
use crate::metrics::MetricsSummary;
use crate::state::AppState;

const DEFAULT_WINDOW_SECS: u64 = 3600;

#[derive(Deserialize)]
pub struct WindowQuery {
    pub window_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct MetricsSummaryResponse {
    pub window_secs: u64,
    pub inference: MetricsSummary,
    pub modules: BTreeMap<&'static str, MetricsSummary>,
    pub cache: CacheStats,
}

/// GET /api/v1/metrics/summary?window_secs=N
pub async fn handle_metrics_summary(
    State(state): State<AppState>,
    Query(params): Query<WindowQuery>,
) -> Json<MetricsSummaryResponse> {
    let window_secs = params.window_secs.unwrap_or(DEFAULT_WINDOW_SECS);
    let window = Duration::from_secs(window_secs);

    let modules = [extract::MODULE, analyze::MODULE, generate::MODULE]
        .into_iter()
        .map(|module| (module, state.metrics.summary_for_module(module, window)))
        .collect();

    Json(MetricsSummaryResponse {
        window_secs,
        inference: state.metrics.summary(window),
        modules,
        cache: state.cache.stats(),
    })
}
