// src/presence/mod.rs (C5 PresenceTracker)
//
// `lastSeenAt` / `deviceOnline` with a privacy-filtered read path. Grounded
// on `routers/messaging/dm_sse.py`'s `_update_presence` (connect/heartbeat/
// disconnect writes) and the disclosure table in the design notes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareLastSeen {
    Everyone,
    Contacts,
    Nobody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresencePrivacy {
    pub share_last_seen: ShareLastSeen,
    pub share_online: bool,
    pub read_receipts: bool,
}

impl Default for PresencePrivacy {
    fn default() -> Self {
        Self { share_last_seen: ShareLastSeen::Everyone, share_online: true, read_receipts: true }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceRow {
    pub user_id: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub device_online: bool,
    pub privacy: PresencePrivacy,
}

/// What a viewer is allowed to see about another user's presence.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PresenceView {
    pub last_seen_at: Option<DateTime<Utc>>,
    pub device_online: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    Own,
    Contact,
    Other,
}

pub struct PresenceTracker {
    pool: SqlitePool,
}

impl PresenceTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn on_connect(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.upsert(user_id, Some(now), Some(true)).await
    }

    /// Heartbeat should only write when at least `update_interval` has
    /// elapsed since the last write; the caller tracks that cadence and
    /// calls this unconditionally when it decides to.
    pub async fn on_heartbeat(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.upsert(user_id, Some(now), None).await
    }

    pub async fn on_disconnect(&self, user_id: i64) -> Result<()> {
        self.upsert(user_id, None, Some(false)).await
    }

    async fn upsert(&self, user_id: i64, last_seen_at: Option<DateTime<Utc>>, device_online: Option<bool>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *tx).await.ok();

        sqlx::query(
            "INSERT INTO user_presence (user_id, last_seen_at, device_online)
             VALUES (?, ?, COALESCE(?, 0))
             ON CONFLICT(user_id) DO UPDATE SET
               last_seen_at = COALESCE(excluded.last_seen_at, user_presence.last_seen_at),
               device_online = COALESCE(?, user_presence.device_online)",
        )
        .bind(user_id)
        .bind(last_seen_at)
        .bind(device_online)
        .bind(device_online)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_raw(&self, user_id: i64) -> Result<Option<PresenceRow>> {
        let row = sqlx::query_as::<_, PresenceRowSql>(
            "SELECT user_id, last_seen_at, device_online, share_last_seen, share_online, read_receipts
             FROM user_presence WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Applies the disclosure table: `shareLastSeen` gates `last_seen_at`,
    /// `shareOnline` independently gates `device_online` for non-self
    /// viewers. `fallback_last_message_at` is used when the stored
    /// `last_seen_at` is null but disclosure is otherwise permitted.
    pub async fn view_as(
        &self,
        target_user_id: i64,
        relationship: Relationship,
        fallback_last_message_at: Option<DateTime<Utc>>,
    ) -> Result<PresenceView> {
        let Some(row) = self.get_raw(target_user_id).await? else {
            return Ok(PresenceView { last_seen_at: None, device_online: None });
        };

        if relationship == Relationship::Own {
            return Ok(PresenceView {
                last_seen_at: row.last_seen_at.or(fallback_last_message_at),
                device_online: Some(row.device_online),
            });
        }

        let last_seen_allowed = match (row.privacy.share_last_seen, relationship) {
            (ShareLastSeen::Everyone, _) => true,
            (ShareLastSeen::Contacts, Relationship::Contact) => true,
            _ => false,
        };

        let last_seen_at = if last_seen_allowed { row.last_seen_at.or(fallback_last_message_at) } else { None };
        let device_online = if last_seen_allowed && row.privacy.share_online { Some(row.device_online) } else { None };

        Ok(PresenceView { last_seen_at, device_online })
    }
}

#[derive(sqlx::FromRow)]
struct PresenceRowSql {
    user_id: i64,
    last_seen_at: Option<DateTime<Utc>>,
    device_online: bool,
    share_last_seen: String,
    share_online: bool,
    read_receipts: bool,
}

impl From<PresenceRowSql> for PresenceRow {
    fn from(row: PresenceRowSql) -> Self {
        let share_last_seen = match row.share_last_seen.as_str() {
            "contacts" => ShareLastSeen::Contacts,
            "nobody" => ShareLastSeen::Nobody,
            _ => ShareLastSeen::Everyone,
        };
        Self {
            user_id: row.user_id,
            last_seen_at: row.last_seen_at,
            device_online: row.device_online,
            privacy: PresencePrivacy { share_last_seen, share_online: row.share_online, read_receipts: row.read_receipts },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE user_presence (
                user_id INTEGER PRIMARY KEY,
                last_seen_at TEXT,
                device_online INTEGER NOT NULL DEFAULT 0,
                share_last_seen TEXT NOT NULL DEFAULT 'everyone',
                share_online INTEGER NOT NULL DEFAULT 1,
                read_receipts INTEGER NOT NULL DEFAULT 1
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn nobody_disclosure_hides_from_non_self() {
        let pool = test_pool().await;
        let tracker = PresenceTracker::new(pool.clone());
        tracker.on_connect(1, Utc::now()).await.unwrap();
        sqlx::query("UPDATE user_presence SET share_last_seen = 'nobody' WHERE user_id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let view = tracker.view_as(1, Relationship::Contact, None).await.unwrap();
        assert!(view.last_seen_at.is_none());
        assert!(view.device_online.is_none());

        let own_view = tracker.view_as(1, Relationship::Own, None).await.unwrap();
        assert!(own_view.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn share_online_false_hides_online_even_when_last_seen_visible() {
        let pool = test_pool().await;
        let tracker = PresenceTracker::new(pool.clone());
        tracker.on_connect(1, Utc::now()).await.unwrap();
        sqlx::query("UPDATE user_presence SET share_online = 0 WHERE user_id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let view = tracker.view_as(1, Relationship::Other, None).await.unwrap();
        assert!(view.last_seen_at.is_some());
        assert!(view.device_online.is_none());
    }
}
