//! On-disk tier: one JSON record per key, fanned out by the key's first two characters.
//!
//! Every operation is async file I/O. Read errors surface as `Err` so the caller can
//! log them and treat the lookup as a miss.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let shard = key.get(..2).unwrap_or("__");
        self.root.join(shard).join(format!("{key}.json"))
    }

    /// Reads a record. `Ok(None)` when the file does not exist.
    pub async fn read(&self, key: &str) -> std::io::Result<Option<DiskRecord>> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let record: DiskRecord = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        // A record stored under the wrong file name is as good as corrupt.
        if record.key != key {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("cache record key mismatch for {key}"),
            ));
        }
        Ok(Some(record))
    }

    /// Writes a record atomically: temp file in the same directory, then rename.
    pub async fn write(&self, record: &DiskRecord) -> std::io::Result<()> {
        let path = self.path_for(&record.key);
        let dir = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(dir).await?;

        let bytes = serde_json::to_vec(record)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        let tmp = dir.join(format!(".{}.{}.tmp", record.key, Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    /// Removes a record. Missing files are not an error.
    pub async fn remove(&self, key: &str) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub async fn clear(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        tokio::fs::create_dir_all(&self.root).await
    }
}
