// src/chat/trivia.rs (C8 ChatSurfaces: trivia-live)
//
// Same ingest shape as global chat, partitioned by `drawDate`. Messages are
// visible only while `TriviaDrawClock::is_trivia_chat_active` says so; likes
// are idempotent (session-level when `message_id` is absent) and bucketed
// by the draw date at write time so overlapping pre/post windows around
// adjacent draws never double-count (see SPEC_FULL.md §9 resolution).

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::config::surfaces::TriviaChatConfig;
use crate::error::{AppError, AppResult};
use crate::events::{keys, ChatEvent, EventBus};
use crate::external::{TriviaDrawClock, UserDirectory};
use crate::idempotency::{IdempotencyGate, IdempotencyScope};
use crate::notifications::{DispatchRequest, NotificationDispatcher, NotificationSurface};
use crate::rate_limit::TieredRateLimiter;
use crate::sanitize::sanitize_message;

const SURFACE: &str = "trivia";

#[derive(Debug, Clone, serde::Serialize)]
pub struct TriviaMessageView {
    pub id: i64,
    pub user_id: i64,
    pub author_display_name: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub reply_to_id: Option<i64>,
}

#[derive(Debug, serde::Serialize)]
pub struct SendResult {
    pub message_id: i64,
    pub created_at: DateTime<Utc>,
    pub duplicate: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct StatusView {
    pub is_active: bool,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub viewer_count: i64,
    pub like_count: i64,
}

pub struct TriviaChatService {
    pool: SqlitePool,
    config: TriviaChatConfig,
    idempotency: IdempotencyGate,
    rate_limiter: TieredRateLimiter,
    events: Arc<EventBus>,
    users: Arc<dyn UserDirectory>,
    draw_clock: Arc<dyn TriviaDrawClock>,
    notifications: Arc<NotificationDispatcher>,
}

impl TriviaChatService {
    pub fn new(
        pool: SqlitePool,
        config: TriviaChatConfig,
        rate_limiter: TieredRateLimiter,
        events: Arc<EventBus>,
        users: Arc<dyn UserDirectory>,
        draw_clock: Arc<dyn TriviaDrawClock>,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            idempotency: IdempotencyGate::new(pool.clone()),
            pool,
            config,
            rate_limiter,
            events,
            users,
            draw_clock,
            notifications,
        }
    }

    async fn current_draw_date(&self) -> AppResult<NaiveDate> {
        let next_draw = self.draw_clock.next_draw_time().await.map_err(AppError::Internal)?;
        Ok(next_draw.date_naive())
    }

    async fn window(&self, draw_date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let noon = draw_date.and_hms_opt(12, 0, 0).unwrap_or_default().and_utc();
        (
            noon - chrono::Duration::minutes(self.config.pre_window_minutes),
            noon + chrono::Duration::minutes(self.config.post_window_minutes),
        )
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

        let now = Utc::now();
        let is_active = self.draw_clock.is_trivia_chat_active(now).await.map_err(AppError::Internal)?;
        if !is_active {
            return Err(AppError::Validation("trivia chat is not active".into()));
        }

        let sanitized = sanitize_message(text).ok_or_else(|| AppError::Validation("empty-message".into()))?;
        if sanitized.chars().count() > self.config.max_message_length {
            return Err(AppError::Validation("message too long".into()));
        }

        let draw_date = self.current_draw_date().await?;

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope {
                surface: SURFACE,
                sender_id,
                client_message_id: cid.clone(),
                secondary_key: Some(draw_date.to_string()),
            };
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
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT id FROM trivia_chat_messages WHERE id = ? AND draw_date = ?")
                    .bind(reply_id)
                    .bind(draw_date.to_string())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(anyhow::Error::from)?;
            if exists.is_none() {
                return Err(AppError::Validation("replyToMessageId does not exist".into()));
            }
        }

        let message_id: i64 = sqlx::query_scalar(
            "INSERT INTO trivia_chat_messages (user_id, text, draw_date, created_at, client_message_id, reply_to_id)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(sender_id)
        .bind(&sanitized)
        .bind(draw_date.to_string())
        .bind(now)
        .bind(&client_message_id)
        .bind(reply_to_id)
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope {
                surface: SURFACE,
                sender_id,
                client_message_id: cid.clone(),
                secondary_key: Some(draw_date.to_string()),
            };
            if let Err(err) = self.idempotency.record(&scope, &message_id.to_string()).await {
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

        let payload = serde_json::json!({
            "type": "trivia_message",
            "message_id": message_id,
            "sender_id": sender_id,
            "text": sanitized,
            "draw_date": draw_date.to_string(),
            "created_at": now,
        });

        let dispatcher = self.notifications.clone();
        let recipients = self.recent_participant_ids(draw_date, sender_id).await.unwrap_or_default();
        tokio::spawn(async move {
            dispatcher
                .dispatch(DispatchRequest {
                    surface: NotificationSurface::Trivia,
                    sender_id,
                    recipients,
                    heading: "New message in Trivia Live".into(),
                    body: sanitized,
                    data: payload,
                })
                .await;
        });

        Ok(SendResult { message_id, created_at: now, duplicate: false })
    }

    pub async fn messages(&self, limit: u32) -> AppResult<(Vec<TriviaMessageView>, bool, DateTime<Utc>, DateTime<Utc>)> {
        let draw_date = self.current_draw_date().await?;
        let (window_start, window_end) = self.window(draw_date).await;
        let is_active = self.draw_clock.is_trivia_chat_active(Utc::now()).await.map_err(AppError::Internal)?;

        let limit = limit.clamp(1, 100) as i64;
        let rows: Vec<TriviaRow> = sqlx::query_as(
            "SELECT id, user_id, text, created_at, reply_to_id FROM trivia_chat_messages
             WHERE draw_date = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(draw_date.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let author_ids: Vec<i64> = rows.iter().map(|r| r.user_id).collect();
        let authors = self.users.get_users(&author_ids).await.map_err(AppError::Internal)?;
        let author_names: std::collections::HashMap<i64, Option<String>> =
            authors.into_iter().map(|u| (u.id, u.display_name)).collect();

        let views = rows
            .into_iter()
            .map(|row| TriviaMessageView {
                author_display_name: author_names.get(&row.user_id).cloned().flatten(),
                id: row.id,
                user_id: row.user_id,
                text: row.text,
                created_at: row.created_at,
                reply_to_id: row.reply_to_id,
            })
            .collect();

        Ok((views, is_active, window_start, window_end))
    }

    pub async fn status(&self) -> AppResult<StatusView> {
        let draw_date = self.current_draw_date().await?;
        let (window_start, window_end) = self.window(draw_date).await;
        let is_active = self.draw_clock.is_trivia_chat_active(Utc::now()).await.map_err(AppError::Internal)?;
        let viewer_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT user_id) FROM trivia_chat_messages WHERE draw_date = ?",
        )
        .bind(draw_date.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        let like_count = self.like_count(draw_date).await?;

        Ok(StatusView { is_active, window_start, window_end, viewer_count, like_count })
    }

    /// Idempotent like: session-level when `message_id` is `None`. Relies on
    /// the `UNIQUE(user_id, draw_date, message_id)` index (NULL-safe in
    /// SQLite: two rows with the same `(user_id, draw_date)` and NULL
    /// `message_id` collide because SQLite treats NULL as distinct in
    /// UNIQUE by default -- handled explicitly here via an existence check
    /// first to stay correct regardless).
    pub async fn like(&self, user_id: i64, message_id: Option<i64>) -> AppResult<()> {
        let draw_date = self.current_draw_date().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM trivia_chat_likes WHERE user_id = ? AND draw_date = ? AND message_id IS ?",
        )
        .bind(user_id)
        .bind(draw_date.to_string())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if existing.is_some() {
            return Ok(());
        }

        sqlx::query("INSERT INTO trivia_chat_likes (user_id, draw_date, message_id) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(draw_date.to_string())
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

        let like_count = self.like_count(draw_date).await?;
        let _ = self
            .events
            .publish(
                keys::TRIVIA_LIKES_CHANNEL,
                &ChatEvent::TriviaMessage { message: serde_json::json!({"type": "like-update", "like_count": like_count}) },
            )
            .await;

        Ok(())
    }

    pub async fn likes(&self) -> AppResult<i64> {
        let draw_date = self.current_draw_date().await?;
        self.like_count(draw_date).await
    }

    async fn like_count(&self, draw_date: NaiveDate) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trivia_chat_likes WHERE draw_date = ?")
            .bind(draw_date.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(count)
    }

    async fn created_at_of(&self, id: i64) -> AppResult<DateTime<Utc>> {
        let created_at: DateTime<Utc> = sqlx::query_scalar("SELECT created_at FROM trivia_chat_messages WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(created_at)
    }

    async fn recent_participant_ids(&self, draw_date: NaiveDate, exclude: i64) -> AppResult<Vec<i64>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM trivia_chat_messages WHERE draw_date = ? AND user_id != ? LIMIT 500",
        )
        .bind(draw_date.to_string())
        .bind(exclude)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(rows)
    }
}

#[derive(sqlx::FromRow)]
struct TriviaRow {
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

    struct AlwaysActive(bool);
    #[async_trait]
    impl TriviaDrawClock for AlwaysActive {
        async fn next_draw_time(&self) -> anyhow::Result<DateTime<Utc>> {
            Ok(Utc::now())
        }
        async fn is_trivia_chat_active(&self, _now: DateTime<Utc>) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

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

    fn service(pool: SqlitePool, active: bool) -> TriviaChatService {
        let events = Arc::new(EventBus::disabled());
        let rl = TieredRateLimiter::new("trivia", 60, 8, StdDuration::from_secs(5), None);
        let mute_store = Arc::new(MuteStore::new(pool.clone()));
        let notifications = Arc::new(NotificationDispatcher::new(
            pool.clone(),
            mute_store,
            Arc::new(NoopPush),
            crate::config::notifications::NotificationsConfig::from_env(),
        ));
        TriviaChatService::new(
            pool,
            TriviaChatConfig::from_env(),
            rl,
            events,
            Arc::new(EmptyUsers),
            Arc::new(AlwaysActive(active)),
            notifications,
        )
    }

    #[tokio::test]
    async fn send_is_rejected_outside_the_active_window() {
        let pool = test_pool().await;
        let svc = service(pool, false);
        let err = svc.send(1, "hi", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_client_message_id_returns_same_message_once() {
        let pool = test_pool().await;
        let svc = service(pool, true);

        let first = svc.send(1, "hi", Some("cid-1".into()), None).await.unwrap();
        let second = svc.send(1, "hi", Some("cid-1".into()), None).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.message_id, second.message_id);

        let (messages, _, _, _) = svc.messages(20).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn session_level_like_is_idempotent() {
        let pool = test_pool().await;
        let svc = service(pool, true);
        svc.like(1, None).await.unwrap();
        svc.like(1, None).await.unwrap();
        assert_eq!(svc.likes().await.unwrap(), 1);
    }
}
