//! Artifact storage for rendered documents: a local directory or an S3-compatible bucket.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ArtifactConfig;

/// Reference to one written document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub name: String,
    pub key: String,
    /// Filesystem path or `s3://bucket/key`.
    pub location: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid artifact key '{0}'")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 upload failed: {0}")]
    S3(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredArtifact, StorageError>;

    fn backend(&self) -> &'static str;
}

/// Keys are relative, slash-separated and may not escape the store root.
fn validate_key(key: &str) -> Result<(), StorageError> {
    let path = Path::new(key);
    let ok = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

fn file_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

// ────────────────────────────────────────────────────────────────────────────
// Local directory
// ────────────────────────────────────────────────────────────────────────────

pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredArtifact, StorageError> {
        validate_key(key)?;
        let path = self.root.join(key);
        let dir = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(dir).await?;

        let size_bytes = bytes.len() as u64;
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Wrote artifact {} ({size_bytes} bytes)", path.display());

        Ok(StoredArtifact {
            name: file_name(key),
            key: key.to_string(),
            location: path.display().to_string(),
            content_type: content_type.to_string(),
            size_bytes,
        })
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

// ────────────────────────────────────────────────────────────────────────────
// S3 / MinIO
// ────────────────────────────────────────────────────────────────────────────

pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredArtifact, StorageError> {
        validate_key(key)?;
        let size_bytes = bytes.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        Ok(StoredArtifact {
            name: file_name(key),
            key: key.to_string(),
            location: format!("s3://{}/{}", self.bucket, key),
            content_type: content_type.to_string(),
            size_bytes,
        })
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(
    endpoint: &str,
    access_key_id: &str,
    secret_access_key: &str,
) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "tailor-static");

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}

pub async fn from_config(config: &ArtifactConfig) -> Arc<dyn ArtifactStore> {
    match config {
        ArtifactConfig::Local { output_dir } => {
            info!("Artifacts written to {}", output_dir.display());
            Arc::new(LocalArtifactStore::new(output_dir))
        }
        ArtifactConfig::S3 {
            bucket,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            let client = build_s3_client(endpoint, access_key_id, secret_access_key).await;
            info!("Artifacts uploaded to s3://{bucket} via {endpoint}");
            Arc::new(S3ArtifactStore::new(client, bucket.clone()))
        }
    }
}
