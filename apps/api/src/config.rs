use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Upper bound for `CACHE_TTL_SECONDS` (ten years).
pub const MAX_CACHE_TTL_SECONDS: u64 = 10 * 365 * 86_400;
/// Upper bound for `JOB_DEADLINE_SECONDS` (one week).
pub const MAX_JOB_DEADLINE_SECONDS: u64 = 7 * 86_400;

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub rust_log: String,
    pub inference: InferenceConfig,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
    pub pipeline: PipelineConfig,
    pub artifacts: ArtifactConfig,
}

/// Settings for the single local inference backend.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    pub model: String,
    /// Used once after the primary model's attempts are exhausted. `None` disables fallback.
    pub fallback_model: Option<String>,
    pub timeout_seconds: u64,
    /// Total attempts against the primary model.
    pub max_retries: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    /// First backoff delay; doubles after every failed attempt.
    pub retry_backoff_ms: u64,
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            fallback_model: Some("llama3.2:3b".to_string()),
            timeout_seconds: 300,
            max_retries: 3,
            temperature: 0.3,
            max_tokens: 4096,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub memory_capacity: usize,
    pub ttl_seconds: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/cache"),
            memory_capacity: 512,
            ttl_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Number of most recent calls kept in memory for summaries.
    pub retention: usize,
    /// Optional JSON-lines file every call record is appended to.
    pub log_path: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: 10_000,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub job_deadline_seconds: u64,
    /// Enables the extra LLM scoring call in the Analyze stage.
    pub llm_scoring: bool,
}

impl PipelineConfig {
    pub fn job_deadline(&self) -> Duration {
        Duration::from_secs(self.job_deadline_seconds)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            job_deadline_seconds: 900,
            llm_scoring: true,
        }
    }
}

/// Where rendered documents are written.
#[derive(Debug, Clone)]
pub enum ArtifactConfig {
    Local {
        output_dir: PathBuf,
    },
    S3 {
        bucket: String,
        endpoint: String,
        access_key_id: String,
        secret_access_key: String,
    },
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let inference_defaults = InferenceConfig::default();
        let inference = InferenceConfig {
            base_url: env_or("INFERENCE_BASE_URL", inference_defaults.base_url)?,
            model: env_or("INFERENCE_MODEL", inference_defaults.model)?,
            fallback_model: match std::env::var("INFERENCE_FALLBACK_MODEL") {
                Ok(v) if v.trim().is_empty() || v == "none" => None,
                Ok(v) => Some(v),
                Err(_) => inference_defaults.fallback_model,
            },
            timeout_seconds: env_or("INFERENCE_TIMEOUT_SECONDS", inference_defaults.timeout_seconds)?,
            max_retries: env_or("INFERENCE_MAX_RETRIES", inference_defaults.max_retries)?,
            temperature: env_or("INFERENCE_TEMPERATURE", inference_defaults.temperature)?,
            max_tokens: env_or("INFERENCE_MAX_TOKENS", inference_defaults.max_tokens)?,
            retry_backoff_ms: env_or("INFERENCE_RETRY_BACKOFF_MS", inference_defaults.retry_backoff_ms)?,
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            enabled: env_or("CACHE_ENABLED", cache_defaults.enabled)?,
            dir: env_or("CACHE_DIR", cache_defaults.dir)?,
            memory_capacity: env_or("CACHE_MEMORY_CAPACITY", cache_defaults.memory_capacity)?,
            ttl_seconds: at_most(
                "CACHE_TTL_SECONDS",
                env_or("CACHE_TTL_SECONDS", cache_defaults.ttl_seconds)?,
                MAX_CACHE_TTL_SECONDS,
            )?,
        };

        let metrics = MetricsConfig {
            retention: env_or("METRICS_RETENTION", MetricsConfig::default().retention)?,
            log_path: std::env::var("METRICS_LOG_PATH").ok().map(PathBuf::from),
        };

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            job_deadline_seconds: at_most(
                "JOB_DEADLINE_SECONDS",
                env_or("JOB_DEADLINE_SECONDS", pipeline_defaults.job_deadline_seconds)?,
                MAX_JOB_DEADLINE_SECONDS,
            )?,
            llm_scoring: env_or("ENABLE_LLM_FIT_SCORING", pipeline_defaults.llm_scoring)?,
        };

        let artifacts = match env_or("ARTIFACT_BACKEND", "local".to_string())?.as_str() {
            "local" => ArtifactConfig::Local {
                output_dir: env_or("OUTPUT_DIR", PathBuf::from("data/output"))?,
            },
            "s3" => ArtifactConfig::S3 {
                bucket: require_env("S3_BUCKET")?,
                endpoint: require_env("S3_ENDPOINT")?,
                access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
                secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            },
            other => bail!("ARTIFACT_BACKEND must be 'local' or 's3', got '{other}'"),
        };

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            port: env_or("PORT", 8080u16).context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            inference,
            cache,
            metrics,
            pipeline,
            artifacts,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

/// Reads and parses an optional variable, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Environment variable '{key}' is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

fn at_most(key: &str, value: u64, max: u64) -> Result<u64> {
    if value > max {
        bail!("Environment variable '{key}' must be at most {max}, got {value}");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_defaults_match_documented_values() {
        let config = InferenceConfig::default();
        assert_eq!(config.timeout_seconds, 300);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff_ms, 1000);
        assert!(config.fallback_model.is_some());
    }

    #[test]
    fn test_pipeline_deadline_default_is_900s() {
        assert_eq!(
            PipelineConfig::default().job_deadline(),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn test_durations_above_bound_are_rejected() {
        assert_eq!(at_most("JOB_DEADLINE_SECONDS", 900, MAX_JOB_DEADLINE_SECONDS).unwrap(), 900);
        assert!(at_most("JOB_DEADLINE_SECONDS", MAX_JOB_DEADLINE_SECONDS, MAX_JOB_DEADLINE_SECONDS).is_ok());
        let err = at_most("CACHE_TTL_SECONDS", u64::MAX, MAX_CACHE_TTL_SECONDS).unwrap_err();
        assert!(err.to_string().contains("CACHE_TTL_SECONDS"));
    }

    #[test]
    fn test_env_or_uses_default_when_unset() {
        let value: u32 = env_or("TAILOR_TEST_SURELY_UNSET_VAR", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_env_or_rejects_unparseable_value() {
        std::env::set_var("TAILOR_TEST_BAD_NUMBER", "not-a-number");
        let result: Result<u32> = env_or("TAILOR_TEST_BAD_NUMBER", 1);
        assert!(result.is_err());
        std::env::remove_var("TAILOR_TEST_BAD_NUMBER");
    }
}
