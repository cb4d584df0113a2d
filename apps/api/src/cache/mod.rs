//! Inference Cache: two-tier (memory LRU + disk) write-through cache for LLM responses.
//!
//! Tier invariants:
//! - every `set` writes both tiers; memory only ever holds entries that were written
//!   to or promoted from disk
//! - memory eviction never touches disk
//! - expired entries read as absent and are removed lazily
//!
//! The cache is an optimization, never a correctness dependency: disk read errors are
//! misses and disk write errors are logged and swallowed.

pub mod disk;
pub mod key;
pub mod memory;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use disk::{DiskRecord, DiskTier};
use memory::{MemoryEntry, MemoryLru};

pub use key::generate_key;

/// Longest lifetime any entry is given.
pub const MAX_TTL: Duration = Duration::from_secs(crate::config::MAX_CACHE_TTL_SECONDS);

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_entries: usize,
}

pub struct InferenceCache {
    enabled: bool,
    memory: Mutex<MemoryLru>,
    disk: DiskTier,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl InferenceCache {
    pub fn new(dir: impl Into<PathBuf>, memory_capacity: usize) -> Self {
        Self {
            enabled: true,
            memory: Mutex::new(MemoryLru::new(memory_capacity)),
            disk: DiskTier::new(dir),
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let mut cache = Self::new(&config.dir, config.memory_capacity);
        cache.enabled = config.enabled;
        cache
    }

    /// A cache that never stores anything. Every lookup is a miss.
    pub fn disabled() -> Self {
        let mut cache = Self::new(std::env::temp_dir().join("tailor-cache-disabled"), 0);
        cache.enabled = false;
        cache
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let now = Utc::now();

        // Memory lock is released before any disk I/O.
        let in_memory = {
            let mut memory = self.memory.lock();
            match memory.get(key) {
                Some(entry) if entry.is_expired(now) => {
                    memory.remove(key);
                    None
                }
                other => other,
            }
        };
        if let Some(entry) = in_memory {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value);
        }

        let record = match self.disk.read(key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                debug!("Cache disk read failed for {key}, treating as miss: {e}");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if now >= record.expires_at {
            if let Err(e) = self.disk.remove(key).await {
                warn!("Failed to remove expired cache entry {key}: {e}");
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let value = record.value.clone();
        self.insert_memory(
            key.to_string(),
            MemoryEntry {
                value: record.value,
                expires_at: record.expires_at,
            },
        );
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Write-through insert into both tiers.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl.min(MAX_TTL))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let expires_at = created_at.checked_add_signed(ttl).unwrap_or(created_at);

        let record = DiskRecord {
            key: key.to_string(),
            value: value.to_string(),
            created_at,
            expires_at,
        };
        if let Err(e) = self.disk.write(&record).await {
            warn!("Cache disk write failed for {key}: {e}");
        }

        self.insert_memory(
            key.to_string(),
            MemoryEntry {
                value: record.value,
                expires_at,
            },
        );
    }

    pub async fn delete(&self, key: &str) {
        self.memory.lock().remove(key);
        if let Err(e) = self.disk.remove(key).await {
            warn!("Cache disk delete failed for {key}: {e}");
        }
    }

    pub async fn clear(&self) {
        self.memory.lock().clear();
        if let Err(e) = self.disk.clear().await {
            warn!("Cache disk clear failed: {e}");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_entries: self.memory.lock().len(),
        }
    }

    fn insert_memory(&self, key: String, entry: MemoryEntry) {
        let evicted = self.memory.lock().insert(key, entry);
        if let Some(evicted) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted {evicted} from memory cache tier");
        }
    }
}
