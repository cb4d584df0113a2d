//! Profile loading: read-only view of a user's current profile entries.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::models::profile::{ProfileEntryRow, UserProfile};

/// Where job submissions read profiles from. Carried as `Arc<dyn ProfileSource>` in app state.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn load(&self, user_id: Uuid) -> Result<UserProfile>;
}

/// Postgres-backed profile source.
pub struct PgProfileSource {
    pool: PgPool,
}

impl PgProfileSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileSource for PgProfileSource {
    async fn load(&self, user_id: Uuid) -> Result<UserProfile> {
        load_profile(&self.pool, user_id).await
    }
}

/// Loads the latest version of every profile entry for a user.
/// Profile entries are append-only; the highest version per `entry_id` wins.
pub async fn load_profile(pool: &PgPool, user_id: Uuid) -> Result<UserProfile> {
    let entries = sqlx::query_as::<_, ProfileEntryRow>(
        r#"
        SELECT DISTINCT ON (entry_id)
            entry_id, version, entry_type, data, raw_text,
            recency_score, impact_score, tags, contribution_type, created_at
        FROM profile_entries
        WHERE user_id = $1
        ORDER BY entry_id, version DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    info!("Loaded {} profile entries for user {}", entries.len(), user_id);
    Ok(UserProfile { user_id, entries })
}
