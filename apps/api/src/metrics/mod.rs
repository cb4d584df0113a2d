//! Metrics Recorder: append-only log of inference calls plus windowed summaries.
//!
//! `record` never blocks on I/O and never fails the caller. The optional durable log
//! is written by a background task fed through an unbounded channel.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MetricsConfig;

/// One logical Inference Client call. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceCall {
    pub module: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub duration_ms: u64,
    pub success: bool,
    pub used_fallback: bool,
    pub cached: bool,
    pub error_kind: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub calls: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub tokens_per_second: f64,
    pub fallback_rate: f64,
    pub cache_hit_rate: f64,
}

pub struct MetricsRecorder {
    calls: Mutex<VecDeque<InferenceCall>>,
    retention: usize,
    sink: Option<mpsc::UnboundedSender<InferenceCall>>,
}

impl MetricsRecorder {
    /// In-memory recorder without a durable log.
    pub fn new(retention: usize) -> Self {
        Self {
            calls: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
            sink: None,
        }
    }

    /// Builds the recorder and, when `log_path` is set, spawns the JSON-lines writer.
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &MetricsConfig) -> Self {
        let mut recorder = Self::new(config.retention);
        if let Some(path) = &config.log_path {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_log_writer(path.clone(), rx));
            recorder.sink = Some(tx);
            info!("Inference metrics log: {}", path.display());
        }
        recorder
    }

    pub fn record(&self, call: InferenceCall) {
        debug!(
            module = %call.module,
            model = %call.model,
            duration_ms = call.duration_ms,
            input_tokens = call.input_tokens,
            output_tokens = call.output_tokens,
            success = call.success,
            used_fallback = call.used_fallback,
            cached = call.cached,
            "inference call recorded"
        );

        if let Some(sink) = &self.sink {
            if sink.send(call.clone()).is_err() {
                warn!("Metrics log writer has stopped; dropping durable record");
            }
        }

        let mut calls = self.calls.lock();
        if calls.len() >= self.retention {
            calls.pop_front();
        }
        calls.push_back(call);
    }

    /// Summary over calls recorded within the last `window`.
    pub fn summary(&self, window: Duration) -> MetricsSummary {
        self.summarize(window, |_| true)
    }

    /// Summary restricted to calls made by one pipeline module.
    pub fn summary_for_module(&self, module: &str, window: Duration) -> MetricsSummary {
        self.summarize(window, |call| call.module == module)
    }

    /// Snapshot of retained calls, oldest first.
    pub fn calls(&self) -> Vec<InferenceCall> {
        self.calls.lock().iter().cloned().collect()
    }

    fn summarize(&self, window: Duration, filter: impl Fn(&InferenceCall) -> bool) -> MetricsSummary {
        // Windows reaching past the representable range cover every retained call.
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let selected: Vec<InferenceCall> = self
            .calls
            .lock()
            .iter()
            .filter(|c| c.timestamp >= cutoff && filter(c))
            .cloned()
            .collect();
        compute_summary(&selected)
    }
}

fn compute_summary(calls: &[InferenceCall]) -> MetricsSummary {
    if calls.is_empty() {
        return MetricsSummary::default();
    }
    let total = calls.len() as f64;
    let successes = calls.iter().filter(|c| c.success).count() as f64;
    let fallbacks = calls.iter().filter(|c| c.used_fallback).count() as f64;
    let cached = calls.iter().filter(|c| c.cached).count() as f64;
    let avg_duration_ms = calls.iter().map(|c| c.duration_ms as f64).sum::<f64>() / total;

    // Throughput only counts work the backend actually did.
    let (tokens, millis) = calls
        .iter()
        .filter(|c| c.success && !c.cached)
        .fold((0u64, 0u64), |(t, ms), c| {
            (t + c.output_tokens as u64, ms + c.duration_ms)
        });
    let tokens_per_second = if millis > 0 {
        tokens as f64 / (millis as f64 / 1000.0)
    } else {
        0.0
    };

    MetricsSummary {
        calls: calls.len(),
        success_rate: successes / total,
        avg_duration_ms,
        tokens_per_second,
        fallback_rate: fallbacks / total,
        cache_hit_rate: cached / total,
    }
}

async fn run_log_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<InferenceCall>) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("Cannot create metrics log directory {}: {e}", parent.display());
        }
    }
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot open metrics log {}: {e}; durable metrics disabled", path.display());
            // Drain so senders never observe a closed channel mid-run.
            while rx.recv().await.is_some() {}
            return;
        }
    };

    while let Some(call) = rx.recv().await {
        let mut line = match serde_json::to_vec(&call) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize metrics record: {e}");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = file.write_all(&line).await {
            warn!("Failed to append metrics record: {e}");
            continue;
        }
        if let Err(e) = file.flush().await {
            warn!("Failed to flush metrics log: {e}");
        }
    }
}
