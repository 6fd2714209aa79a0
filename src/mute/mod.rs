// src/mute/mod.rs (C4 MuteStore)
//
// Per-user notification mute preferences: two booleans for the broadcast
// surfaces (global, trivia) and a JSON-encoded list of muted user ids for
// private chat. Grounded on `utils/chat_mute.py`; SQLite has no
// `SELECT ... FOR UPDATE`, so the row-lock there becomes a `BEGIN
// IMMEDIATE` transaction here, which takes the write lock up front and
// gives the same lost-update protection.

use std::collections::HashSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSurface {
    Global,
    Trivia,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MutePreferences {
    pub user_id: i64,
    pub global_chat_muted: bool,
    pub trivia_chat_muted: bool,
    /// JSON array of muted user ids, or NULL when empty.
    pub private_chat_muted_users: Option<String>,
}

impl MutePreferences {
    fn default_for(user_id: i64) -> Self {
        Self {
            user_id,
            global_chat_muted: false,
            trivia_chat_muted: false,
            private_chat_muted_users: None,
        }
    }

    pub fn muted_user_ids(&self) -> Vec<i64> {
        self.private_chat_muted_users
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<i64>>(raw).ok())
            .unwrap_or_default()
    }

    pub fn is_muted(&self, surface: ChatSurface) -> bool {
        match surface {
            ChatSurface::Global => self.global_chat_muted,
            ChatSurface::Trivia => self.trivia_chat_muted,
        }
    }
}

pub struct MuteStore {
    pool: SqlitePool,
}

impl MuteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mirrors `get_mute_preferences`: fetches the row, or synthesizes an
    /// unsaved default (when `create_if_missing` is false) or inserts one.
    pub async fn get_or_create(&self, user_id: i64, create_if_missing: bool) -> Result<MutePreferences> {
        if let Some(row) = self.fetch(user_id).await? {
            return Ok(row);
        }
        if !create_if_missing {
            return Ok(MutePreferences::default_for(user_id));
        }

        sqlx::query(
            "INSERT INTO chat_mute_preferences (user_id, global_chat_muted, trivia_chat_muted, private_chat_muted_users)
             VALUES (?, 0, 0, NULL)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        self.fetch(user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("mute preferences row missing after insert for user {user_id}"))
    }

    pub async fn is_chat_muted(&self, user_id: i64, surface: ChatSurface) -> Result<bool> {
        let prefs = self.get_or_create(user_id, false).await?;
        Ok(prefs.is_muted(surface))
    }

    /// Batch lookup; never creates rows for users with no preferences set.
    pub async fn get_muted_user_ids(&self, user_ids: &[i64], surface: ChatSurface) -> Result<HashSet<i64>> {
        if user_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let column = match surface {
            ChatSurface::Global => "global_chat_muted",
            ChatSurface::Trivia => "trivia_chat_muted",
        };

        let placeholders = user_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT user_id FROM chat_mute_preferences WHERE {column} = 1 AND user_id IN ({placeholders})"
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in user_ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn is_muted_for_private_chat(&self, user_id: i64, muted_by_user_id: i64) -> Result<bool> {
        let prefs = self.get_or_create(muted_by_user_id, false).await?;
        Ok(prefs.muted_user_ids().contains(&user_id))
    }

    pub async fn get_muted_users(&self, user_id: i64) -> Result<Vec<i64>> {
        let prefs = self.get_or_create(user_id, false).await?;
        Ok(prefs.muted_user_ids())
    }

    pub async fn add_muted_user(&self, user_id: i64, muted_user_id: i64) -> Result<()> {
        self.mutate_muted_users(user_id, |muted| {
            if !muted.contains(&muted_user_id) {
                muted.push(muted_user_id);
            }
        })
        .await
    }

    pub async fn remove_muted_user(&self, user_id: i64, unmuted_user_id: i64) -> Result<()> {
        self.mutate_muted_users(user_id, |muted| {
            muted.retain(|id| *id != unmuted_user_id);
        })
        .await
    }

    async fn mutate_muted_users(&self, user_id: i64, edit: impl FnOnce(&mut Vec<i64>)) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *tx).await.ok();

        sqlx::query(
            "INSERT INTO chat_mute_preferences (user_id, global_chat_muted, trivia_chat_muted, private_chat_muted_users)
             VALUES (?, 0, 0, NULL)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT private_chat_muted_users FROM chat_mute_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut muted = current
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<i64>>(raw).ok())
            .unwrap_or_default();
        edit(&mut muted);

        let encoded = if muted.is_empty() { None } else { Some(serde_json::to_string(&muted)?) };

        sqlx::query("UPDATE chat_mute_preferences SET private_chat_muted_users = ? WHERE user_id = ?")
            .bind(encoded)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fetch(&self, user_id: i64) -> Result<Option<MutePreferences>> {
        let row = sqlx::query_as::<_, MutePreferences>(
            "SELECT user_id, global_chat_muted, trivia_chat_muted, private_chat_muted_users
             FROM chat_mute_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE chat_mute_preferences (
                user_id INTEGER PRIMARY KEY,
                global_chat_muted INTEGER NOT NULL DEFAULT 0,
                trivia_chat_muted INTEGER NOT NULL DEFAULT 0,
                private_chat_muted_users TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn get_or_create_without_create_returns_unsaved_default() {
        let pool = test_pool().await;
        let store = MuteStore::new(pool.clone());
        let prefs = store.get_or_create(1, false).await.unwrap();
        assert!(!prefs.global_chat_muted);

        let row = store.fetch(1).await.unwrap();
        assert!(row.is_none(), "should not have persisted a row");
    }

    #[tokio::test]
    async fn add_and_remove_muted_user_roundtrip() {
        let pool = test_pool().await;
        let store = MuteStore::new(pool);

        store.add_muted_user(1, 42).await.unwrap();
        assert_eq!(store.get_muted_users(1).await.unwrap(), vec![42]);

        store.add_muted_user(1, 42).await.unwrap();
        assert_eq!(store.get_muted_users(1).await.unwrap(), vec![42], "no duplicates");

        store.remove_muted_user(1, 42).await.unwrap();
        assert!(store.get_muted_users(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_muted_user_ids_batch_lookup() {
        let pool = test_pool().await;
        let store = MuteStore::new(pool);
        store.get_or_create(1, true).await.unwrap();
        store.get_or_create(2, true).await.unwrap();
        sqlx::query("UPDATE chat_mute_preferences SET global_chat_muted = 1 WHERE user_id = 1")
            .execute(&store.pool)
            .await
            .unwrap();

        let muted = store.get_muted_user_ids(&[1, 2, 3], ChatSurface::Global).await.unwrap();
        assert_eq!(muted, HashSet::from([1]));
    }
}
