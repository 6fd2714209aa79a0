// src/status.rs
// Status posts — a small adjacent feature: not one of the twelve budgeted
// components, but its SSE envelope and `StatusEnabled` gate are named
// explicitly in the wire contract (§6), so it gets a minimal implementation
// rather than a stub. Fan-out only; no feed/reaction logic, which the
// distillation never specified.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::{AppError, AppResult};
use crate::events::{ChatEvent, EventBus};

#[derive(Debug, Clone, Serialize)]
pub struct StatusPostView {
    pub id: String,
    pub owner_user_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct StatusService {
    pool: SqlitePool,
    events: std::sync::Arc<EventBus>,
    enabled: bool,
}

impl StatusService {
    pub fn new(pool: SqlitePool, events: std::sync::Arc<EventBus>, enabled: bool) -> Self {
        Self { pool, events, enabled }
    }

    pub async fn create(&self, owner_user_id: i64, ttl_hours: i64) -> AppResult<StatusPostView> {
        if !self.enabled {
            return Err(AppError::FeatureDisabled);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::hours(ttl_hours.max(1));

        sqlx::query("INSERT INTO status_posts (id, owner_user_id, created_at, expires_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(owner_user_id)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

        let view = StatusPostView { id, owner_user_id, created_at: now, expires_at };

        let payload = serde_json::json!({
            "postId": view.id,
            "ownerUserId": view.owner_user_id,
            "createdAt": view.created_at,
            "expiresAt": view.expires_at,
        });
        let _ = self.events.publish(crate::events::keys::dm_channel(owner_user_id).as_str(), &ChatEvent::StatusPost { post: payload }).await;

        Ok(view)
    }

    pub async fn active_for(&self, owner_user_id: i64) -> AppResult<Vec<StatusPostView>> {
        let rows: Vec<(String, i64, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, owner_user_id, created_at, expires_at FROM status_posts
             WHERE owner_user_id = ? AND expires_at > ? ORDER BY created_at DESC",
        )
        .bind(owner_user_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(rows
            .into_iter()
            .map(|(id, owner_user_id, created_at, expires_at)| StatusPostView { id, owner_user_id, created_at, expires_at })
            .collect())
    }

    /// Periodic sweep dropping expired posts; run from the same background
    /// loop the other surfaces use for retention cleanup.
    pub async fn cleanup(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM status_posts WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(result.rows_affected())
    }
}
