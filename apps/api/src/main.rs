mod cache;
mod config;
mod db;
mod errors;
mod generation;
mod llm_client;
mod metrics;
mod models;
mod pipeline;
mod profile;
mod routes;
mod state;
mod storage;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::InferenceCache;
use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::backend::OllamaBackend;
use crate::llm_client::InferenceClient;
use crate::metrics::MetricsRecorder;
use crate::pipeline::{LlmPipeline, Orchestrator};
use crate::profile::PgProfileSource;
use crate::routes::build_router;
use crate::state::AppState;

/// How long cancelled jobs get to publish their final state on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tailor API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL (profile entries, read-only)
    let db = create_pool(&config.database_url).await?;

    // Shared inference plumbing
    let cache = Arc::new(InferenceCache::from_config(&config.cache));
    let metrics = Arc::new(MetricsRecorder::from_config(&config.metrics));
    let backend = Arc::new(OllamaBackend::new(&config.inference.base_url)?);
    let client = Arc::new(InferenceClient::new(
        backend,
        cache.clone(),
        metrics.clone(),
        config.inference.clone(),
        config.cache.ttl(),
    ));
    info!(
        "Inference client initialized (model: {}, fallback: {})",
        config.inference.model,
        config.inference.fallback_model.as_deref().unwrap_or("none")
    );

    // Artifact store: local directory or S3 / MinIO
    let store = storage::from_config(&config.artifacts).await;

    // Pipeline + orchestrator
    let stages = Arc::new(LlmPipeline::new(
        client,
        store,
        config.pipeline.llm_scoring,
    ));
    let orchestrator = Arc::new(Orchestrator::new(stages, config.pipeline.job_deadline()));
    info!(
        "Orchestrator ready (job deadline: {}s, LLM fit scoring: {})",
        config.pipeline.job_deadline_seconds, config.pipeline.llm_scoring
    );

    // Build app state
    let state = AppState {
        orchestrator: orchestrator.clone(),
        profiles: Arc::new(PgProfileSource::new(db)),
        metrics,
        cache,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict allowed origins once a frontend host is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown();
    let unsettled = orchestrator.drain(SHUTDOWN_GRACE).await;
    info!("Shutdown complete ({unsettled} jobs still running were abandoned)");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
