//! Inference backend boundary: a single local Ollama-compatible HTTP endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One model invocation as seen by the backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Asks the backend to constrain output to JSON.
    pub json_mode: bool,
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("could not decode backend response: {0}")]
    Decode(String),

    #[error("backend returned empty content")]
    EmptyContent,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn chat(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;

    fn name(&self) -> &'static str;
}

// ────────────────────────────────────────────────────────────────────────────
// Ollama
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    model: Option<String>,
    message: Option<OllamaMessage>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorBody {
    error: String,
}

/// Speaks `POST {base_url}/api/chat` with streaming disabled.
///
/// Request timeouts are enforced by `InferenceClient`, not here, so the same bound
/// applies to every backend implementation.
#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn chat(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let body = OllamaChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream: false,
            format: request.json_mode.then_some("json"),
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OllamaErrorBody>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        let content = parsed
            .message
            .map(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(BackendError::EmptyContent)?;

        let input_tokens = parsed.prompt_eval_count.unwrap_or_else(|| {
            estimate_tokens(request.messages.iter().map(|m| m.content.as_str()))
        });
        let output_tokens = parsed
            .eval_count
            .unwrap_or_else(|| estimate_tokens(std::iter::once(content.as_str())));

        debug!(
            "Ollama chat succeeded: model={}, input_tokens={input_tokens}, output_tokens={output_tokens}",
            request.model
        );

        Ok(BackendResponse {
            content,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
            input_tokens,
            output_tokens,
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

/// Rough token estimate (4 characters per token) for backends that omit counts.
pub fn estimate_tokens<'a>(texts: impl Iterator<Item = &'a str>) -> u32 {
    let chars: usize = texts.map(|t| t.chars().count()).sum();
    chars.div_ceil(4) as u32
}
