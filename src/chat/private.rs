// src/chat/private.rs (C8 ChatSurfaces: per-pair private conversations)
//
// Request/accept state machine gating message visibility. Canonical pair
// ordering (`user_a < user_b`) is enforced on creation so lookup is a
// single equality, per the data model's invariant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::chat::block::BlockRepo;
use crate::config::surfaces::PrivateChatConfig;
use crate::error::{AppError, AppResult};
use crate::events::{keys, ChatEvent, EventBus};
use crate::external::{AdminRegistry, UserDirectory};
use crate::idempotency::{IdempotencyGate, IdempotencyScope};
use crate::mute::MuteStore;
use crate::notifications::{DispatchRequest, NotificationDispatcher, NotificationSurface};
use crate::presence::{PresenceTracker, Relationship};
use crate::rate_limit::TieredRateLimiter;
use crate::sanitize::sanitize_message;

const SURFACE: &str = "private";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ConversationStatus {
    fn from_str(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ConversationRow {
    id: i64,
    user_a: i64,
    user_b: i64,
    requested_by: i64,
    status: String,
    last_message_at: Option<DateTime<Utc>>,
    last_read_message_id_a: Option<i64>,
    last_read_message_id_b: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SendResult {
    pub conversation_id: i64,
    pub message_id: i64,
    pub created_at: DateTime<Utc>,
    pub status: ConversationStatus,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: i64,
    pub sender_id: i64,
    pub text: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub reply_to_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub id: i64,
    pub peer_id: i64,
    pub peer_display_name: Option<String>,
    pub status: ConversationStatus,
    pub requested_by_me: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    pub presence: crate::presence::PresenceView,
}

pub struct PrivateChatService {
    pool: SqlitePool,
    config: PrivateChatConfig,
    idempotency: IdempotencyGate,
    rate_limiter: TieredRateLimiter,
    events: Arc<EventBus>,
    blocks: BlockRepo,
    admin_registry: Arc<dyn AdminRegistry>,
    users: Arc<dyn UserDirectory>,
    presence: Arc<PresenceTracker>,
    mute_store: Arc<MuteStore>,
    notifications: Arc<NotificationDispatcher>,
}

impl PrivateChatService {
    pub fn new(
        pool: SqlitePool,
        config: PrivateChatConfig,
        rate_limiter: TieredRateLimiter,
        events: Arc<EventBus>,
        admin_registry: Arc<dyn AdminRegistry>,
        users: Arc<dyn UserDirectory>,
        presence: Arc<PresenceTracker>,
        mute_store: Arc<MuteStore>,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            idempotency: IdempotencyGate::new(pool.clone()),
            blocks: BlockRepo::new(pool.clone()),
            pool,
            config,
            rate_limiter,
            events,
            admin_registry,
            users,
            presence,
            mute_store,
            notifications,
        }
    }

    fn canonical_pair(a: i64, b: i64) -> (i64, i64) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn peer_of(row: &ConversationRow, user_id: i64) -> i64 {
        if row.user_a == user_id {
            row.user_b
        } else {
            row.user_a
        }
    }

    async fn fetch_by_pair(&self, a: i64, b: i64) -> AppResult<Option<ConversationRow>> {
        let (lo, hi) = Self::canonical_pair(a, b);
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user_a, user_b, requested_by, status, last_message_at, last_read_message_id_a, last_read_message_id_b
             FROM private_conversations WHERE user_a = ? AND user_b = ?",
        )
        .bind(lo)
        .bind(hi)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(row)
    }

    async fn fetch_by_id(&self, id: i64) -> AppResult<ConversationRow> {
        sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user_a, user_b, requested_by, status, last_message_at, last_read_message_id_a, last_read_message_id_b
             FROM private_conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound("conversation not found".into()))
    }

    fn require_participant(row: &ConversationRow, user_id: i64) -> AppResult<()> {
        if row.user_a != user_id && row.user_b != user_id {
            return Err(AppError::authz("not a participant in this conversation"));
        }
        Ok(())
    }

    pub async fn send(
        &self,
        sender_id: i64,
        recipient_id: i64,
        text: &str,
        client_message_id: Option<String>,
        reply_to_id: Option<i64>,
    ) -> AppResult<SendResult> {
        if !self.config.enabled {
            return Err(AppError::FeatureDisabled);
        }
        if sender_id == recipient_id {
            return Err(AppError::Validation("cannot message yourself".into()));
        }
        if self.blocks.is_blocked_either_direction(sender_id, recipient_id).await.map_err(AppError::Internal)? {
            return Err(AppError::Blocked);
        }

        let sanitized = sanitize_message(text).ok_or_else(|| AppError::Validation("empty-message".into()))?;
        if sanitized.chars().count() > self.config.max_message_length {
            return Err(AppError::Validation("message too long".into()));
        }

        let (lo, hi) = Self::canonical_pair(sender_id, recipient_id);
        let row = match self.fetch_by_pair(sender_id, recipient_id).await? {
            Some(row) => row,
            None => {
                let auto_accept = self.config.admin_auto_accept
                    && self.admin_registry.is_admin_pair(sender_id, recipient_id).await.map_err(AppError::Internal)?;
                let status = if auto_accept { ConversationStatus::Accepted } else { ConversationStatus::Pending };
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO private_conversations (user_a, user_b, requested_by, status, responded_at)
                     VALUES (?, ?, ?, ?, ?) RETURNING id",
                )
                .bind(lo)
                .bind(hi)
                .bind(sender_id)
                .bind(status.as_str())
                .bind(if auto_accept { Some(Utc::now()) } else { None })
                .fetch_one(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;

                ConversationRow {
                    id,
                    user_a: lo,
                    user_b: hi,
                    requested_by: sender_id,
                    status: status.as_str().to_string(),
                    last_message_at: None,
                    last_read_message_id_a: None,
                    last_read_message_id_b: None,
                }
            }
        };

        let status = ConversationStatus::from_str(&row.status);

        // Idempotency is checked ahead of the pending one-message guard: a
        // retried request message (the one message most likely to be
        // retried, since it's sent before the recipient has even seen it)
        // must short-circuit to the prior result rather than trip the
        // "only one request message" rule on its own retry.
        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope {
                surface: SURFACE,
                sender_id,
                client_message_id: cid.clone(),
                secondary_key: Some(row.id.to_string()),
            };
            if let Some(existing_id) = self.idempotency.check(&scope).await? {
                let existing_id: i64 = existing_id.parse().map_err(|_| anyhow::anyhow!("corrupt idempotency result_id"))?;
                let created_at = self.created_at_of(existing_id).await?;
                return Ok(SendResult { conversation_id: row.id, message_id: existing_id, created_at, status, duplicate: true });
            }
        }

        match status {
            ConversationStatus::Rejected => {
                return Err(AppError::authz("conversation was rejected"));
            }
            ConversationStatus::Pending => {
                if row.requested_by != sender_id {
                    return Err(AppError::authz("recipient must accept before replying"));
                }
                let already_sent: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM private_messages WHERE conversation_id = ? AND sender_id = ?",
                )
                .bind(row.id)
                .bind(sender_id)
                .fetch_one(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;
                if already_sent > 0 {
                    return Err(AppError::authz("only one request message allowed while pending"));
                }
            }
            ConversationStatus::Accepted => {}
        }

        let rl_key = keys::rate_limit_key(SURFACE, sender_id);
        let result = self.rate_limiter.check(&rl_key).await;
        if !result.allowed {
            return Err(AppError::RateLimited { retry_after_seconds: result.retry_after_seconds });
        }

        if let Some(reply_id) = reply_to_id {
            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM private_messages WHERE id = ? AND conversation_id = ?",
            )
            .bind(reply_id)
            .bind(row.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
            if exists.is_none() {
                return Err(AppError::Validation("replyToMessageId does not exist".into()));
            }
        }

        let now = Utc::now();
        let message_id: i64 = sqlx::query_scalar(
            "INSERT INTO private_messages (conversation_id, sender_id, text, created_at, client_message_id, reply_to_id)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(row.id)
        .bind(sender_id)
        .bind(&sanitized)
        .bind(now)
        .bind(&client_message_id)
        .bind(reply_to_id)
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        sqlx::query("UPDATE private_conversations SET last_message_at = ? WHERE id = ?")
            .bind(now)
            .bind(row.id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope {
                surface: SURFACE,
                sender_id,
                client_message_id: cid.clone(),
                secondary_key: Some(row.id.to_string()),
            };
            if let Err(err) = self.idempotency.record(&scope, &message_id.to_string()).await {
                let sqlx_err = err.downcast::<sqlx::Error>().map_err(AppError::Internal)?;
                if !IdempotencyGate::is_unique_violation(&sqlx_err) {
                    return Err(AppError::Internal(sqlx_err.into()));
                }
                if let Some(existing_id) = self.idempotency.check(&scope).await? {
                    let existing_id: i64 = existing_id.parse().map_err(|_| anyhow::anyhow!("corrupt idempotency result_id"))?;
                    let created_at = self.created_at_of(existing_id).await?;
                    return Ok(SendResult { conversation_id: row.id, message_id: existing_id, created_at, status, duplicate: true });
                }
            }
        }

        let peer = Self::peer_of(&row, sender_id);
        let payload = serde_json::json!({
            "type": "private_message",
            "conversation_id": row.id,
            "message_id": message_id,
            "sender_id": sender_id,
            "text": sanitized,
            "created_at": now,
        });
        let _ = self
            .events
            .publish(&keys::dm_channel(peer), &ChatEvent::PrivateMessage { conversation_id: row.id, message: payload.clone() })
            .await;

        let dispatcher = self.notifications.clone();
        let heading = "New private message".to_string();
        let body = sanitized.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(DispatchRequest {
                    surface: NotificationSurface::Private,
                    sender_id,
                    recipients: vec![peer],
                    heading,
                    body,
                    data: payload,
                })
                .await;
        });

        Ok(SendResult { conversation_id: row.id, message_id, created_at: now, status, duplicate: false })
    }

    /// Lists every conversation the user participates in, newest activity
    /// first, hydrated with the peer's display name and privacy-filtered
    /// presence.
    pub async fn list_conversations(&self, user_id: i64) -> AppResult<Vec<ConversationSummary>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            "SELECT id, user_a, user_b, requested_by, status, last_message_at, last_read_message_id_a, last_read_message_id_b
             FROM private_conversations WHERE user_a = ? OR user_b = ?
             ORDER BY COALESCE(last_message_at, '1970-01-01') DESC, id DESC",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let peer_ids: Vec<i64> = rows.iter().map(|r| Self::peer_of(r, user_id)).collect();
        let peers = self.users.get_users(&peer_ids).await.map_err(AppError::Internal)?;
        let peer_names: std::collections::HashMap<i64, Option<String>> =
            peers.into_iter().map(|u| (u.id, u.display_name)).collect();

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let peer_id = Self::peer_of(row, user_id);
            let last_read = if row.user_a == user_id { row.last_read_message_id_a } else { row.last_read_message_id_b };
            let unread_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM private_messages WHERE conversation_id = ? AND sender_id != ? AND id > ?",
            )
            .bind(row.id)
            .bind(user_id)
            .bind(last_read.unwrap_or(0))
            .fetch_one(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

            let presence = self.presence.view_as(peer_id, Relationship::Contact, row.last_message_at).await.map_err(AppError::Internal)?;

            summaries.push(ConversationSummary {
                id: row.id,
                peer_id,
                peer_display_name: peer_names.get(&peer_id).cloned().flatten(),
                status: ConversationStatus::from_str(&row.status),
                requested_by_me: row.requested_by == user_id,
                last_message_at: row.last_message_at,
                unread_count,
                presence,
            });
        }

        Ok(summaries)
    }

    pub async fn conversation_detail(&self, conversation_id: i64, user_id: i64) -> AppResult<ConversationSummary> {
        let row = self.fetch_by_id(conversation_id).await?;
        Self::require_participant(&row, user_id)?;

        let peer_id = Self::peer_of(&row, user_id);
        let peer = self.users.get_user(peer_id).await.map_err(AppError::Internal)?;
        let last_read = if row.user_a == user_id { row.last_read_message_id_a } else { row.last_read_message_id_b };
        let unread_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM private_messages WHERE conversation_id = ? AND sender_id != ? AND id > ?",
        )
        .bind(row.id)
        .bind(user_id)
        .bind(last_read.unwrap_or(0))
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        let presence = self.presence.view_as(peer_id, Relationship::Contact, row.last_message_at).await.map_err(AppError::Internal)?;

        Ok(ConversationSummary {
            id: row.id,
            peer_id,
            peer_display_name: peer.and_then(|u| u.display_name),
            status: ConversationStatus::from_str(&row.status),
            requested_by_me: row.requested_by == user_id,
            last_message_at: row.last_message_at,
            unread_count,
            presence,
        })
    }

    pub async fn accept_reject(&self, conversation_id: i64, user_id: i64, accept: bool) -> AppResult<ConversationStatus> {
        let row = self.fetch_by_id(conversation_id).await?;
        Self::require_participant(&row, user_id)?;
        if row.requested_by == user_id {
            return Err(AppError::Validation("requester cannot accept/reject their own request".into()));
        }
        if ConversationStatus::from_str(&row.status) != ConversationStatus::Pending {
            return Err(AppError::Validation("conversation is not pending".into()));
        }

        let new_status = if accept { ConversationStatus::Accepted } else { ConversationStatus::Rejected };
        sqlx::query("UPDATE private_conversations SET status = ?, responded_at = ? WHERE id = ?")
            .bind(new_status.as_str())
            .bind(Utc::now())
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

        Ok(new_status)
    }

    pub async fn messages(&self, conversation_id: i64, user_id: i64, limit: u32) -> AppResult<Vec<MessageView>> {
        let row = self.fetch_by_id(conversation_id).await?;
        Self::require_participant(&row, user_id)?;

        let status = ConversationStatus::from_str(&row.status);
        if status == ConversationStatus::Pending && row.requested_by != user_id {
            return Err(AppError::authz("conversation must be accepted before messages can be viewed"));
        }

        let limit = limit.clamp(1, 100) as i64;
        let rows: Vec<(i64, i64, String, String, DateTime<Utc>, Option<i64>)> = sqlx::query_as(
            "SELECT id, sender_id, text, status, created_at, reply_to_id FROM private_messages
             WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(rows
            .into_iter()
            .map(|(id, sender_id, text, status, created_at, reply_to_id)| MessageView { id, sender_id, text, status, created_at, reply_to_id })
            .collect())
    }

    pub async fn mark_read(&self, conversation_id: i64, user_id: i64, message_id: Option<i64>) -> AppResult<()> {
        let row = self.fetch_by_id(conversation_id).await?;
        Self::require_participant(&row, user_id)?;

        let target = match message_id {
            Some(id) => id,
            None => sqlx::query_scalar(
                "SELECT id FROM private_messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
            )
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)?
            .unwrap_or(0),
        };

        let column = if row.user_a == user_id { "last_read_message_id_a" } else { "last_read_message_id_b" };
        let sql = format!("UPDATE private_conversations SET {column} = ? WHERE id = ?");
        sqlx::query(&sql).bind(target).bind(conversation_id).execute(&self.pool).await.map_err(anyhow::Error::from)?;

        sqlx::query("UPDATE private_messages SET status = 'read' WHERE conversation_id = ? AND id <= ? AND sender_id != ? AND status != 'read'")
            .bind(conversation_id)
            .bind(target)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

        let peer = Self::peer_of(&row, user_id);
        let _ = self
            .events
            .publish(
                &keys::dm_channel(peer),
                &ChatEvent::PrivateMessage {
                    conversation_id,
                    message: serde_json::json!({"type": "messages-read", "reader_id": user_id, "up_to": target}),
                },
            )
            .await;

        Ok(())
    }

    /// Forward-only `sent -> delivered`; idempotent (repeated calls no-op
    /// once already delivered or read).
    pub async fn mark_delivered(&self, message_id: i64, user_id: i64) -> AppResult<()> {
        let conversation_id: i64 = sqlx::query_scalar("SELECT conversation_id FROM private_messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)?
            .ok_or_else(|| AppError::NotFound("message not found".into()))?;

        let row = self.fetch_by_id(conversation_id).await?;
        Self::require_participant(&row, user_id)?;

        sqlx::query(
            "UPDATE private_messages SET status = 'delivered', delivered_at = ?
             WHERE id = ? AND sender_id != ? AND status = 'sent'",
        )
        .bind(Utc::now())
        .bind(message_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(())
    }

    pub async fn typing(&self, conversation_id: i64, user_id: i64, stop: bool) -> AppResult<()> {
        let row = self.fetch_by_id(conversation_id).await?;
        Self::require_participant(&row, user_id)?;
        let channel_key = format!("private:{conversation_id}");

        if stop {
            self.events.clear_typing(&channel_key, user_id).await;
            return Ok(());
        }

        if !self.events.should_emit_typing(&channel_key, user_id, 1500).await {
            return Ok(());
        }

        let peer = Self::peer_of(&row, user_id);
        let _ = self
            .events
            .publish(
                &keys::dm_channel(peer),
                &ChatEvent::Typing { channel: channel_key, user_id },
            )
            .await;
        Ok(())
    }

    pub async fn block(&self, user_id: i64, target_id: i64) -> AppResult<()> {
        self.blocks.block(user_id, target_id).await.map_err(AppError::Internal)
    }

    pub async fn unblock(&self, user_id: i64, target_id: i64) -> AppResult<()> {
        self.blocks.unblock(user_id, target_id).await.map_err(AppError::Internal)
    }

    pub async fn list_blocks(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let rows = self.blocks.list_blocked_by(user_id).await.map_err(AppError::Internal)?;
        Ok(rows.into_iter().map(|r| r.blocked_id).collect())
    }

    pub async fn peer_presence(&self, viewer_id: i64, peer_id: i64) -> AppResult<crate::presence::PresenceView> {
        let is_contact = self.fetch_by_pair(viewer_id, peer_id).await?.is_some();
        let relationship = if is_contact { Relationship::Contact } else { Relationship::Other };
        self.presence.view_as(peer_id, relationship, None).await.map_err(AppError::Internal)
    }

    pub async fn is_muted(&self, user_id: i64, peer_id: i64) -> AppResult<bool> {
        self.mute_store.is_muted_for_private_chat(peer_id, user_id).await.map_err(AppError::Internal)
    }

    async fn created_at_of(&self, id: i64) -> AppResult<DateTime<Utc>> {
        let created_at: DateTime<Utc> = sqlx::query_scalar("SELECT created_at FROM private_messages WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::UserSummary;
    use crate::push::{PushBatchResult, PushPayload, PushProvider, PushTarget};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;

    struct NoAdmins;
    #[async_trait]
    impl AdminRegistry for NoAdmins {
        async fn admin_user_ids(&self) -> anyhow::Result<Vec<i64>> {
            Ok(Vec::new())
        }
    }

    struct AllAdmins(Vec<i64>);
    #[async_trait]
    impl AdminRegistry for AllAdmins {
        async fn admin_user_ids(&self) -> anyhow::Result<Vec<i64>> {
            Ok(self.0.clone())
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

    fn service(pool: SqlitePool, admin_registry: Arc<dyn AdminRegistry>) -> PrivateChatService {
        let events = Arc::new(EventBus::disabled());
        let rl = TieredRateLimiter::new("private", 60, 8, StdDuration::from_secs(5), None);
        let presence = Arc::new(PresenceTracker::new(pool.clone()));
        let mute_store = Arc::new(MuteStore::new(pool.clone()));
        let notifications = Arc::new(NotificationDispatcher::new(
            pool.clone(),
            mute_store.clone(),
            Arc::new(NoopPush),
            crate::config::notifications::NotificationsConfig::from_env(),
        ));
        PrivateChatService::new(
            pool,
            PrivateChatConfig::from_env(),
            rl,
            events,
            admin_registry,
            Arc::new(EmptyUsers),
            presence,
            mute_store,
            notifications,
        )
    }

    #[tokio::test]
    async fn request_accept_flow_gates_recipient_view_until_accepted() {
        let pool = test_pool().await;
        let svc = service(pool, Arc::new(NoAdmins));

        let sent = svc.send(1, 2, "hi", None, None).await.unwrap();
        assert_eq!(sent.status, ConversationStatus::Pending);
        assert!(!sent.duplicate);

        // Recipient cannot view while pending.
        let err = svc.messages(sent.conversation_id, 2, 20).await.unwrap_err();
        assert!(matches!(err, AppError::Authz { .. }));

        // Requester can only send one message while pending.
        let err = svc.send(1, 2, "again", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Authz { .. }));

        let status = svc.accept_reject(sent.conversation_id, 2, true).await.unwrap();
        assert_eq!(status, ConversationStatus::Accepted);

        let messages = svc.messages(sent.conversation_id, 2, 20).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, 1);
    }

    #[tokio::test]
    async fn rejected_conversation_is_terminal() {
        let pool = test_pool().await;
        let svc = service(pool, Arc::new(NoAdmins));

        let sent = svc.send(1, 2, "hi", None, None).await.unwrap();
        svc.accept_reject(sent.conversation_id, 2, false).await.unwrap();

        let err = svc.send(1, 2, "again", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Authz { .. }));
    }

    #[tokio::test]
    async fn admin_pair_auto_accepts() {
        let pool = test_pool().await;
        let svc = service(pool, Arc::new(AllAdmins(vec![2])));

        let sent = svc.send(1, 2, "hi", None, None).await.unwrap();
        assert_eq!(sent.status, ConversationStatus::Accepted);
        // Recipient can view immediately; requester can send more than one.
        let follow_up = svc.send(1, 2, "again", None, None).await.unwrap();
        assert!(!follow_up.duplicate);
    }

    #[tokio::test]
    async fn duplicate_client_message_id_returns_same_message() {
        let pool = test_pool().await;
        let svc = service(pool, Arc::new(AllAdmins(vec![1, 2])));

        let first = svc.send(1, 2, "hi", Some("cid-1".into()), None).await.unwrap();
        let second = svc.send(1, 2, "hi", Some("cid-1".into()), None).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.message_id, second.message_id);
    }

    #[tokio::test]
    async fn duplicate_client_message_id_while_pending_returns_same_message() {
        let pool = test_pool().await;
        let svc = service(pool, Arc::new(NoAdmins));

        let first = svc.send(1, 2, "hi", Some("cid-1".into()), None).await.unwrap();
        assert_eq!(first.status, ConversationStatus::Pending);
        assert!(!first.duplicate);

        // A retry of the same request message must short-circuit to the
        // prior result rather than trip the one-message-while-pending rule.
        let second = svc.send(1, 2, "hi", Some("cid-1".into()), None).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.status, ConversationStatus::Pending);

        // The pending limit still applies to a genuinely new message.
        let err = svc.send(1, 2, "again", Some("cid-2".into()), None).await.unwrap_err();
        assert!(matches!(err, AppError::Authz { .. }));
    }

    #[tokio::test]
    async fn blocked_pair_cannot_send() {
        let pool = test_pool().await;
        let svc = service(pool, Arc::new(NoAdmins));
        svc.block(2, 1).await.unwrap();

        let err = svc.send(1, 2, "hi", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Blocked));
    }

    #[tokio::test]
    async fn cannot_message_self() {
        let pool = test_pool().await;
        let svc = service(pool, Arc::new(NoAdmins));
        let err = svc.send(1, 1, "hi", None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
