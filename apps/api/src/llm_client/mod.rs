/// Inference Client — the single point of entry for all model calls in Tailor.
///
/// ARCHITECTURAL RULE: stage executors never talk to the backend directly.
/// Every call goes through `InferenceClient`, which layers on, in order:
/// cache lookup → bounded-timeout backend call → exponential-backoff retries on the
/// primary model → one fallback-model attempt → cache write + usage metrics.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{generate_key, InferenceCache};
use crate::config::InferenceConfig;
use crate::metrics::{InferenceCall, MetricsRecorder};

pub mod backend;
pub mod prompts;

pub use backend::{BackendError, BackendRequest, BackendResponse, ChatMessage, InferenceBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceErrorKind {
    Timeout,
    BackendUnavailable,
    MalformedResponse,
    AllModelsExhausted,
    Cancelled,
}

impl InferenceErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::BackendUnavailable => "backend_unavailable",
            Self::MalformedResponse => "malformed_response",
            Self::AllModelsExhausted => "all_models_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("model {model} did not respond within {}s", timeout.as_secs_f64())]
    Timeout { model: String, timeout: Duration },

    #[error("inference backend unavailable for model {model}: {reason}")]
    BackendUnavailable { model: String, reason: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("all models exhausted (primary {primary} after {attempts} attempts, fallback {fallback}): {last_error}")]
    AllModelsExhausted {
        primary: String,
        fallback: String,
        attempts: u32,
        last_error: String,
    },

    #[error("inference call cancelled")]
    Cancelled,
}

impl InferenceError {
    pub fn kind(&self) -> InferenceErrorKind {
        match self {
            Self::Timeout { .. } => InferenceErrorKind::Timeout,
            Self::BackendUnavailable { .. } => InferenceErrorKind::BackendUnavailable,
            Self::MalformedResponse(_) => InferenceErrorKind::MalformedResponse,
            Self::AllModelsExhausted { .. } => InferenceErrorKind::AllModelsExhausted,
            Self::Cancelled => InferenceErrorKind::Cancelled,
        }
    }
}

/// Per-call overrides. `None` fields fall back to `InferenceConfig`.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    /// Skip the cache read (the response is still written back).
    pub bypass_cache: bool,
}

impl GenerateOptions {
    pub fn json() -> Self {
        Self {
            json_mode: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub duration_ms: u64,
    pub cached: bool,
    pub used_fallback: bool,
    #[serde(skip)]
    pub cache_key: String,
}

/// Payload persisted in the cache for one response.
#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    content: String,
    /// Model that actually produced the reply, which may be the fallback.
    model: String,
    input_tokens: u32,
    output_tokens: u32,
    #[serde(default)]
    used_fallback: bool,
}

/// A typed structured response. `validate` runs after deserialization; a failure is
/// reported as `MalformedResponse` just like a schema mismatch.
pub trait StructuredOutput: DeserializeOwned {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

pub struct InferenceClient {
    backend: Arc<dyn InferenceBackend>,
    cache: Arc<InferenceCache>,
    metrics: Arc<MetricsRecorder>,
    config: InferenceConfig,
    cache_ttl: Duration,
}

impl InferenceClient {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        cache: Arc<InferenceCache>,
        metrics: Arc<MetricsRecorder>,
        config: InferenceConfig,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            cache,
            metrics,
            config,
            cache_ttl,
        }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Runs a chat completion with caching, retry and fallback.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        module: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<InferenceResponse, InferenceError> {
        let temperature = options.temperature.unwrap_or(self.config.temperature);
        let max_tokens = options.max_tokens.unwrap_or(self.config.max_tokens);
        let cache_key = self.cache_key(messages, temperature, max_tokens, options.json_mode);

        if !options.bypass_cache {
            if let Some(response) = self.cached_response(&cache_key, module).await {
                return Ok(response);
            }
        }

        let started = Instant::now();
        let outcome = self
            .call_with_fallback(messages, temperature, max_tokens, options.json_mode, cancel)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((response, used_fallback)) => {
                let payload = CachedResponse {
                    content: response.content.clone(),
                    model: response.model.clone(),
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    used_fallback,
                };
                match serde_json::to_string(&payload) {
                    Ok(serialized) => self.cache.set(&cache_key, &serialized, self.cache_ttl).await,
                    Err(e) => warn!("Failed to serialize response for cache: {e}"),
                }

                self.metrics.record(InferenceCall {
                    module: module.to_string(),
                    model: response.model.clone(),
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    duration_ms,
                    success: true,
                    used_fallback,
                    cached: false,
                    error_kind: None,
                    timestamp: Utc::now(),
                });

                Ok(InferenceResponse {
                    content: response.content,
                    model: response.model,
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    duration_ms,
                    cached: false,
                    used_fallback,
                    cache_key,
                })
            }
            Err(e) => {
                self.metrics.record(InferenceCall {
                    module: module.to_string(),
                    model: self.config.model.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    duration_ms,
                    success: false,
                    used_fallback: matches!(e, InferenceError::AllModelsExhausted { .. }),
                    cached: false,
                    error_kind: Some(e.kind().as_str().to_string()),
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }

    /// Calls the model in JSON mode and deserializes the reply into `T`.
    ///
    /// Parse or validation failures are `MalformedResponse` and evict the cached
    /// response, so a caller that retries reaches the backend again.
    pub async fn generate_structured<T: StructuredOutput>(
        &self,
        prompt: &str,
        system: &str,
        module: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<T, InferenceError> {
        let messages = [ChatMessage::system(system), ChatMessage::user(prompt)];
        let options = GenerateOptions {
            json_mode: true,
            ..options.clone()
        };
        let response = self.generate(&messages, module, &options, cancel).await?;

        match parse_structured::<T>(&response.content) {
            Ok(parsed) => Ok(parsed),
            Err(reason) => {
                warn!("{module}: structured response rejected: {reason}");
                self.cache.delete(&response.cache_key).await;
                Err(InferenceError::MalformedResponse(reason))
            }
        }
    }

    fn cache_key(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        json_mode: bool,
    ) -> String {
        let prompt = serde_json::to_string(messages).unwrap_or_default();
        let params = BTreeMap::from([
            ("max_tokens".to_string(), json!(max_tokens)),
            ("json_mode".to_string(), json!(json_mode)),
        ]);
        generate_key(&prompt, &self.config.model, temperature, &params)
    }

    async fn cached_response(&self, cache_key: &str, module: &str) -> Option<InferenceResponse> {
        let raw = self.cache.get(cache_key).await?;
        let cached: CachedResponse = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Discarding unreadable cache entry {cache_key}: {e}");
                self.cache.delete(cache_key).await;
                return None;
            }
        };

        debug!("{module}: cache hit ({cache_key})");
        self.metrics.record(InferenceCall {
            module: module.to_string(),
            model: cached.model.clone(),
            input_tokens: cached.input_tokens,
            output_tokens: cached.output_tokens,
            duration_ms: 0,
            success: true,
            used_fallback: cached.used_fallback,
            cached: true,
            error_kind: None,
            timestamp: Utc::now(),
        });

        Some(InferenceResponse {
            content: cached.content,
            model: cached.model,
            input_tokens: cached.input_tokens,
            output_tokens: cached.output_tokens,
            duration_ms: 0,
            cached: true,
            used_fallback: cached.used_fallback,
            cache_key: cache_key.to_string(),
        })
    }

    /// `max_retries` attempts on the primary model, then a single fallback attempt.
    async fn call_with_fallback(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        json_mode: bool,
        cancel: &CancellationToken,
    ) -> Result<(BackendResponse, bool), InferenceError> {
        let primary = self.config.model.as_str();
        let attempts = self.config.max_retries.max(1);
        let mut last_error: Option<InferenceError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                // Exponential backoff: base, 2×base, 4×base, …
                let delay = Duration::from_millis(
                    self.config
                        .retry_backoff_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16)),
                );
                warn!(
                    "Inference attempt {}/{} on {} failed, retrying after {}ms...",
                    attempt,
                    attempts,
                    primary,
                    delay.as_millis()
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self
                .call_once(primary, messages, temperature, max_tokens, json_mode, cancel)
                .await
            {
                Ok(response) => return Ok((response, false)),
                Err(InferenceError::Cancelled) => return Err(InferenceError::Cancelled),
                Err(e) => last_error = Some(e),
            }
        }

        let last_error = last_error.unwrap_or_else(|| InferenceError::BackendUnavailable {
            model: primary.to_string(),
            reason: "no attempts made".to_string(),
        });

        let fallback = match self.config.fallback_model.as_deref() {
            Some(fallback) if fallback != primary => fallback,
            _ => return Err(last_error),
        };

        info!("Primary model {primary} exhausted after {attempts} attempts; trying fallback {fallback}");
        match self
            .call_once(fallback, messages, temperature, max_tokens, json_mode, cancel)
            .await
        {
            Ok(response) => Ok((response, true)),
            Err(InferenceError::Cancelled) => Err(InferenceError::Cancelled),
            Err(e) => Err(InferenceError::AllModelsExhausted {
                primary: primary.to_string(),
                fallback: fallback.to_string(),
                attempts,
                last_error: e.to_string(),
            }),
        }
    }

    async fn call_once(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        json_mode: bool,
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, InferenceError> {
        let request = BackendRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature,
            max_tokens,
            json_mode,
        };
        let timeout = self.config.timeout();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InferenceError::Cancelled),
            result = tokio::time::timeout(timeout, self.backend.chat(&request)) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(InferenceError::BackendUnavailable {
                    model: model.to_string(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(InferenceError::Timeout {
                    model: model.to_string(),
                    timeout,
                }),
            },
        }
    }
}

fn parse_structured<T: StructuredOutput>(content: &str) -> Result<T, String> {
    let text = strip_json_fences(content);
    let parsed: T = serde_json::from_str(text).map_err(|e| e.to_string())?;
    parsed.validate()?;
    Ok(parsed)
}

/// Strips ```json ... ``` or ``` ... ``` code fences from model output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let inner = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"));
    match inner {
        Some(stripped) => {
            let stripped = stripped.trim_start();
            stripped
                .strip_suffix("```")
                .map(|s| s.trim())
                .unwrap_or(stripped)
        }
        None => text,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Title {
        title: String,
    }

    impl StructuredOutput for Title {
        fn validate(&self) -> Result<(), String> {
            if self.title.is_empty() {
                return Err("title is empty".to_string());
            }
            Ok(())
        }
    }

    fn msgs() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hi")]
    }

    #[test]
    fn test_strip_json_fences_with_json_tag() {
        let input = "```json\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_strip_json_fences_without_tag() {
        let input = "```\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_strip_json_fences_no_fences() {
        let input = "{\"key\": \"value\"}";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_failures_exhaust_retries_then_one_fallback() {
        let backend = Arc::new(ScriptedBackend::new());
        let (client, metrics) = client_with(backend.clone(), test_config());

        let err = client
            .generate(&msgs(), "extract", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), InferenceErrorKind::AllModelsExhausted);
        assert_eq!(
            backend.models_called(),
            vec!["primary", "primary", "primary", "fallback"]
        );
        let calls = metrics.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].success);
        assert_eq!(calls[0].error_kind.as_deref(), Some("all_models_exhausted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let backend = Arc::new(ScriptedBackend::new());
        let config = InferenceConfig {
            fallback_model: None,
            ..test_config()
        };
        let (client, _) = client_with(backend.clone(), config);

        let started = tokio::time::Instant::now();
        let err = client
            .generate(&msgs(), "extract", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        // 1s + 2s of backoff between three attempts.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
        assert_eq!(err.kind(), InferenceErrorKind::BackendUnavailable);
        assert_eq!(backend.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_success_is_flagged() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .script("primary", vec![Scripted::Fail, Scripted::Fail, Scripted::Fail])
                .script("fallback", vec![Scripted::Reply("from fallback".into())]),
        );
        let (client, metrics) = client_with(backend, test_config());

        let response = client
            .generate(&msgs(), "generate", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content, "from fallback");
        assert!(response.used_fallback);
        assert!(!response.cached);
        assert!(metrics.calls()[0].used_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_second_primary_attempt() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .script("primary", vec![Scripted::Fail, Scripted::Reply("ok".into())]),
        );
        let (client, _) = client_with(backend.clone(), test_config());
        let response = client
            .generate(&msgs(), "extract", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
        assert!(!response.used_fallback);
        assert_eq!(backend.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_backend_times_out() {
        let backend = Arc::new(ScriptedBackend::new().script("primary", vec![Scripted::Hang]));
        let config = InferenceConfig {
            max_retries: 1,
            fallback_model: None,
            timeout_seconds: 5,
            ..test_config()
        };
        let (client, _) = client_with(backend, config);
        let err = client
            .generate(&msgs(), "extract", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), InferenceErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let backend = Arc::new(ScriptedBackend::new());
        let (client, _) = client_with(backend.clone(), test_config());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = client
            .generate(&msgs(), "extract", &GenerateOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), InferenceErrorKind::Cancelled);
        assert_eq!(backend.count(), 1, "no attempt after cancellation");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::always("cached answer"));
        let metrics = Arc::new(MetricsRecorder::new(100));
        let client = InferenceClient::new(
            backend.clone(),
            Arc::new(InferenceCache::new(dir.path(), 8)),
            metrics.clone(),
            test_config(),
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();

        let first = client
            .generate(&msgs(), "extract", &GenerateOptions::default(), &cancel)
            .await
            .unwrap();
        let second = client
            .generate(&msgs(), "extract", &GenerateOptions::default(), &cancel)
            .await
            .unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.content, "cached answer");
        assert_eq!(backend.count(), 1);
        let calls = metrics.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].cached);
        assert_eq!(calls[1].duration_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_fallback_reply_keeps_its_model() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            ScriptedBackend::new()
                .script("primary", vec![Scripted::Fail, Scripted::Fail, Scripted::Fail])
                .script("fallback", vec![Scripted::Reply("from fallback".into())]),
        );
        let metrics = Arc::new(MetricsRecorder::new(100));
        let client = InferenceClient::new(
            backend.clone(),
            Arc::new(InferenceCache::new(dir.path(), 8)),
            metrics.clone(),
            test_config(),
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();

        client
            .generate(&msgs(), "analyze", &GenerateOptions::default(), &cancel)
            .await
            .unwrap();
        let hit = client
            .generate(&msgs(), "analyze", &GenerateOptions::default(), &cancel)
            .await
            .unwrap();

        assert!(hit.cached);
        assert_eq!(hit.model, "fallback");
        assert!(hit.used_fallback);
        assert_eq!(backend.count(), 4);
        let calls = metrics.calls();
        assert_eq!(calls[1].model, "fallback");
        assert!(calls[1].used_fallback);
    }

    #[tokio::test]
    async fn test_structured_parses_fenced_json() {
        let backend = Arc::new(ScriptedBackend::always("```json\n{\"title\": \"Engineer\"}\n```"));
        let (client, _) = client_with(backend.clone(), test_config());
        let parsed: Title = client
            .generate_structured("p", "s", "extract", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(parsed.title, "Engineer");
        assert!(backend.calls.lock()[0].json_mode);
    }

    #[tokio::test]
    async fn test_structured_schema_mismatch_is_malformed_and_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::always("{\"name\": \"wrong field\"}"));
        let client = InferenceClient::new(
            backend.clone(),
            Arc::new(InferenceCache::new(dir.path(), 8)),
            Arc::new(MetricsRecorder::new(10)),
            test_config(),
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let err = client
                .generate_structured::<Title>("p", "s", "extract", &GenerateOptions::default(), &cancel)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), InferenceErrorKind::MalformedResponse);
        }
        // The rejected response was not served from cache the second time.
        assert_eq!(backend.count(), 2);
    }

    #[tokio::test]
    async fn test_structured_validation_failure_is_malformed() {
        let backend = Arc::new(ScriptedBackend::always("{\"title\": \"\"}"));
        let (client, _) = client_with(backend, test_config());
        let err = client
            .generate_structured::<Title>("p", "s", "extract", &GenerateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::MalformedResponse(ref m) if m.contains("empty")));
    }
}
