// src/groups/mod.rs (C11 GroupPipeline)
//
// Membership, epoch invariant and sender-keyed group messages. Every
// membership-affecting operation runs inside a transaction that takes a
// write lock on the `groups` row (`SELECT ... FOR UPDATE` has no SQLite
// equivalent; the transaction's exclusive hold on the row serves the
// same purpose against this pool) and bumps `group_epoch` before commit.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::chat::block::BlockRepo;
use crate::config::groups::GroupsConfig;
use crate::e2ee::E2EEKeyRegistry;
use crate::error::{AppError, AppResult};
use crate::events::{keys, ChatEvent, EventBus};
use crate::idempotency::{IdempotencyGate, IdempotencyScope};
use crate::rate_limit::TieredRateLimiter;

const SURFACE: &str = "group";
const B64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    fn from_str(s: &str) -> Self {
        match s {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            _ => Self::Member,
        }
    }
    fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }
    fn can_manage_members(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct GroupRow {
    id: String,
    title: String,
    about: Option<String>,
    photo_url: Option<String>,
    created_by: i64,
    max_participants: i64,
    group_epoch: i64,
    is_closed: bool,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct GroupView {
    pub id: String,
    pub title: String,
    pub about: Option<String>,
    pub photo_url: Option<String>,
    pub created_by: i64,
    pub max_participants: i64,
    pub group_epoch: i64,
    pub is_closed: bool,
    pub updated_at: DateTime<Utc>,
    pub participant_count: i64,
}

#[derive(Debug, Serialize)]
pub struct ParticipantView {
    pub user_id: i64,
    pub role: Role,
    pub is_banned: bool,
    pub joined_at: DateTime<Utc>,
    pub mute_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SendResult {
    pub message_id: String,
    pub group_epoch: i64,
    pub created_at: DateTime<Utc>,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: String,
    pub group_id: String,
    pub sender_user_id: i64,
    pub sender_device_id: String,
    pub ciphertext: String,
    pub proto: String,
    pub group_epoch: i64,
    pub reply_to_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct InviteView {
    pub id: String,
    pub code: String,
    pub invite_type: String,
    pub expires_at: DateTime<Utc>,
    pub max_uses: Option<i64>,
    pub uses: i64,
    pub target_user_id: Option<i64>,
}

pub struct GroupPipeline {
    pool: SqlitePool,
    config: GroupsConfig,
    idempotency: IdempotencyGate,
    rate_limiter: TieredRateLimiter,
    events: Arc<EventBus>,
    blocks: BlockRepo,
    registry: Arc<E2EEKeyRegistry>,
}

impl GroupPipeline {
    pub fn new(
        pool: SqlitePool,
        config: GroupsConfig,
        rate_limiter: TieredRateLimiter,
        events: Arc<EventBus>,
        registry: Arc<E2EEKeyRegistry>,
    ) -> Self {
        Self {
            idempotency: IdempotencyGate::new(pool.clone()),
            blocks: BlockRepo::new(pool.clone()),
            pool,
            config,
            rate_limiter,
            events,
            registry,
        }
    }

    fn require_enabled(&self) -> AppResult<()> {
        if !self.config.enabled {
            return Err(AppError::FeatureDisabled);
        }
        Ok(())
    }

    async fn fetch_group(&self, group_id: &str) -> AppResult<GroupRow> {
        sqlx::query_as::<_, GroupRow>(
            "SELECT id, title, about, photo_url, created_by, max_participants, group_epoch, is_closed, updated_at
             FROM groups WHERE id = ?",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound("group not found".into()))
    }

    async fn participant_count(&self, group_id: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_participants WHERE group_id = ? AND is_banned = 0",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(count)
    }

    async fn role_of(&self, group_id: &str, user_id: i64) -> AppResult<Option<(Role, bool)>> {
        let row: Option<(String, bool)> = sqlx::query_as(
            "SELECT role, is_banned FROM group_participants WHERE group_id = ? AND user_id = ?",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(row.map(|(role, banned)| (Role::from_str(&role), banned)))
    }

    async fn require_active_member(&self, group_id: &str, user_id: i64) -> AppResult<Role> {
        match self.role_of(group_id, user_id).await? {
            Some((_, true)) => Err(AppError::authz("banned from this group")),
            Some((role, false)) => Ok(role),
            None => Err(AppError::authz("not a member of this group")),
        }
    }

    async fn view_of(&self, row: GroupRow) -> AppResult<GroupView> {
        let participant_count = self.participant_count(&row.id).await?;
        Ok(GroupView {
            id: row.id,
            title: row.title,
            about: row.about,
            photo_url: row.photo_url,
            created_by: row.created_by,
            max_participants: row.max_participants,
            group_epoch: row.group_epoch,
            is_closed: row.is_closed,
            updated_at: row.updated_at,
            participant_count,
        })
    }

    /// Bumps the group epoch inside the caller's transaction and publishes
    /// the change once the transaction is known to have committed. Callers
    /// run this last, right before `tx.commit()`.
    async fn bump_epoch(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, group_id: &str) -> AppResult<i64> {
        let new_epoch: i64 = sqlx::query_scalar(
            "UPDATE groups SET group_epoch = group_epoch + 1, updated_at = ? WHERE id = ? RETURNING group_epoch",
        )
        .bind(Utc::now())
        .bind(group_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(new_epoch)
    }

    async fn publish_epoch_change(&self, group_id: &str, new_epoch: i64, reason: &str) {
        let uuid = uuid::Uuid::parse_str(group_id).unwrap_or_else(|_| uuid::Uuid::nil());
        let _ = self
            .events
            .publish(
                &keys::group_channel(uuid),
                &ChatEvent::EpochChanged { group_id: uuid, new_epoch, reason: reason.to_string() },
            )
            .await;
    }

    pub async fn create_group(
        &self,
        owner_id: i64,
        title: &str,
        about: Option<String>,
        photo_url: Option<String>,
    ) -> AppResult<GroupView> {
        self.require_enabled()?;
        if title.trim().is_empty() {
            return Err(AppError::Validation("title is required".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        sqlx::query(
            "INSERT INTO groups (id, title, about, photo_url, created_by, max_participants, group_epoch, is_closed)
             VALUES (?, ?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(&id)
        .bind(title.trim())
        .bind(&about)
        .bind(&photo_url)
        .bind(owner_id)
        .bind(self.config.max_participants as i64)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        sqlx::query(
            "INSERT INTO group_participants (group_id, user_id, role) VALUES (?, ?, 'owner')",
        )
        .bind(&id)
        .bind(owner_id)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        tx.commit().await.map_err(anyhow::Error::from)?;

        let row = self.fetch_group(&id).await?;
        self.view_of(row).await
    }

    pub async fn update_group(
        &self,
        group_id: &str,
        caller_id: i64,
        title: Option<String>,
        about: Option<Option<String>>,
        photo_url: Option<Option<String>>,
    ) -> AppResult<GroupView> {
        self.require_enabled()?;
        let role = self.require_active_member(group_id, caller_id).await?;
        if !role.can_manage_members() {
            return Err(AppError::authz("only owners and admins may update the group"));
        }

        let row = self.fetch_group(group_id).await?;
        let new_title = title.unwrap_or(row.title);
        let new_about = about.unwrap_or(row.about);
        let new_photo = photo_url.unwrap_or(row.photo_url);

        sqlx::query("UPDATE groups SET title = ?, about = ?, photo_url = ?, updated_at = ? WHERE id = ?")
            .bind(&new_title)
            .bind(&new_about)
            .bind(&new_photo)
            .bind(Utc::now())
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

        let row = self.fetch_group(group_id).await?;
        self.view_of(row).await
    }

    pub async fn close_group(&self, group_id: &str, caller_id: i64) -> AppResult<()> {
        self.require_enabled()?;
        let role = self.require_active_member(group_id, caller_id).await?;
        if role != Role::Owner {
            return Err(AppError::authz("only the owner may close the group"));
        }
        sqlx::query("UPDATE groups SET is_closed = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub async fn group_detail(&self, group_id: &str, caller_id: i64) -> AppResult<GroupView> {
        self.require_active_member(group_id, caller_id).await?;
        let row = self.fetch_group(group_id).await?;
        self.view_of(row).await
    }

    pub async fn list_members(&self, group_id: &str, caller_id: i64) -> AppResult<Vec<ParticipantView>> {
        self.require_active_member(group_id, caller_id).await?;
        let rows: Vec<(i64, String, bool, DateTime<Utc>, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT user_id, role, is_banned, joined_at, mute_until FROM group_participants WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(rows
            .into_iter()
            .map(|(user_id, role, is_banned, joined_at, mute_until)| ParticipantView {
                user_id,
                role: Role::from_str(&role),
                is_banned,
                joined_at,
                mute_until,
            })
            .collect())
    }

    pub async fn add_member(&self, group_id: &str, caller_id: i64, target_user_id: i64) -> AppResult<GroupView> {
        self.require_enabled()?;
        let role = self.require_active_member(group_id, caller_id).await?;
        if !role.can_manage_members() {
            return Err(AppError::authz("only owners and admins may add members"));
        }
        if self.blocks.is_blocked_either_direction(caller_id, target_user_id).await.map_err(AppError::Internal)? {
            return Err(AppError::Blocked);
        }

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT id, title, about, photo_url, created_by, max_participants, group_epoch, is_closed, updated_at
             FROM groups WHERE id = ?",
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound("group not found".into()))?;

        let current: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_participants WHERE group_id = ? AND is_banned = 0",
        )
        .bind(group_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;
        if current >= row.max_participants {
            return Err(AppError::group_full());
        }

        sqlx::query(
            "INSERT INTO group_participants (group_id, user_id, role) VALUES (?, ?, 'member')
             ON CONFLICT(group_id, user_id) DO UPDATE SET is_banned = 0",
        )
        .bind(group_id)
        .bind(target_user_id)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        let new_epoch = Self::bump_epoch(&mut tx, group_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;
        self.publish_epoch_change(group_id, new_epoch, "member_added").await;

        let row = self.fetch_group(group_id).await?;
        self.view_of(row).await
    }

    pub async fn remove_member(&self, group_id: &str, caller_id: i64, target_user_id: i64) -> AppResult<GroupView> {
        self.require_enabled()?;
        let role = self.require_active_member(group_id, caller_id).await?;
        if !role.can_manage_members() {
            return Err(AppError::authz("only owners and admins may remove members"));
        }
        let target_role = self.role_of(group_id, target_user_id).await?;
        if matches!(target_role, Some((Role::Owner, _))) {
            return Err(AppError::authz("the owner cannot be removed"));
        }

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        sqlx::query("DELETE FROM group_participants WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(target_user_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;
        let new_epoch = Self::bump_epoch(&mut tx, group_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;
        self.publish_epoch_change(group_id, new_epoch, "member_removed").await;

        let row = self.fetch_group(group_id).await?;
        self.view_of(row).await
    }

    pub async fn set_role(&self, group_id: &str, caller_id: i64, target_user_id: i64, new_role: Role) -> AppResult<()> {
        self.require_enabled()?;
        let caller_role = self.require_active_member(group_id, caller_id).await?;
        if caller_role != Role::Owner {
            return Err(AppError::authz("only the owner may promote or demote members"));
        }
        if new_role == Role::Owner {
            return Err(AppError::Validation("ownership transfer is not supported".into()));
        }
        let target_role = self.role_of(group_id, target_user_id).await?;
        if matches!(target_role, None | Some((Role::Owner, _))) {
            return Err(AppError::Validation("target is not an adjustable member".into()));
        }

        sqlx::query("UPDATE group_participants SET role = ? WHERE group_id = ? AND user_id = ?")
            .bind(new_role.as_str())
            .bind(group_id)
            .bind(target_user_id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub async fn ban_member(&self, group_id: &str, caller_id: i64, target_user_id: i64, reason: Option<String>) -> AppResult<GroupView> {
        self.require_enabled()?;
        let caller_role = self.require_active_member(group_id, caller_id).await?;
        if !caller_role.can_manage_members() {
            return Err(AppError::authz("only owners and admins may ban members"));
        }
        let target_role = self.role_of(group_id, target_user_id).await?;
        if matches!(target_role, Some((Role::Owner, _))) {
            return Err(AppError::authz("the owner cannot be banned"));
        }

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        sqlx::query("UPDATE group_participants SET is_banned = 1 WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(target_user_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;
        sqlx::query(
            "INSERT INTO group_bans (group_id, user_id, banned_by, reason) VALUES (?, ?, ?, ?)
             ON CONFLICT(group_id, user_id) DO UPDATE SET banned_by = excluded.banned_by, reason = excluded.reason, created_at = datetime('now')",
        )
        .bind(group_id)
        .bind(target_user_id)
        .bind(caller_id)
        .bind(&reason)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;
        let new_epoch = Self::bump_epoch(&mut tx, group_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;
        self.publish_epoch_change(group_id, new_epoch, "member_banned").await;

        let row = self.fetch_group(group_id).await?;
        self.view_of(row).await
    }

    pub async fn unban_member(&self, group_id: &str, caller_id: i64, target_user_id: i64) -> AppResult<GroupView> {
        self.require_enabled()?;
        let caller_role = self.require_active_member(group_id, caller_id).await?;
        if !caller_role.can_manage_members() {
            return Err(AppError::authz("only owners and admins may unban members"));
        }

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        sqlx::query("UPDATE group_participants SET is_banned = 0 WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(target_user_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;
        sqlx::query("DELETE FROM group_bans WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(target_user_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;
        let new_epoch = Self::bump_epoch(&mut tx, group_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;
        self.publish_epoch_change(group_id, new_epoch, "member_unbanned").await;

        let row = self.fetch_group(group_id).await?;
        self.view_of(row).await
    }

    pub async fn send(
        &self,
        group_id: &str,
        sender_user_id: i64,
        sender_device_id: &str,
        claimed_epoch: i64,
        ciphertext_b64: &str,
        proto: &str,
        reply_to_id: Option<String>,
        client_message_id: Option<String>,
    ) -> AppResult<SendResult> {
        self.require_enabled()?;
        self.require_active_member(group_id, sender_user_id).await?;

        let group = self.fetch_group(group_id).await?;
        if group.is_closed {
            return Err(AppError::Validation("group is closed".into()));
        }
        if claimed_epoch != group.group_epoch {
            return Err(AppError::epoch_stale(group.group_epoch));
        }

        self.registry.require_active_device(sender_device_id, sender_user_id).await?;

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope { surface: SURFACE, sender_id: sender_user_id, client_message_id: cid.clone(), secondary_key: Some(group_id.to_string()) };
            if let Some(existing_id) = self.idempotency.check(&scope).await? {
                let created_at = self.created_at_of(&existing_id).await?;
                return Ok(SendResult { message_id: existing_id, group_epoch: group.group_epoch, created_at, duplicate: true });
            }
        }

        let ciphertext = B64
            .decode(ciphertext_b64)
            .map_err(|_| AppError::Validation("ciphertext is not valid base64".into()))?;
        if ciphertext.len() > self.registry.max_message_size_bytes() {
            return Err(AppError::Validation("ciphertext exceeds max message size".into()));
        }

        let rl_key = keys::rate_limit_key(SURFACE, sender_user_id);
        let result = self.rate_limiter.check(&rl_key).await;
        if !result.allowed {
            return Err(AppError::RateLimited { retry_after_seconds: result.retry_after_seconds });
        }

        if let Some(ref reply_id) = reply_to_id {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM group_messages WHERE id = ? AND group_id = ?")
                .bind(reply_id)
                .bind(group_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;
            if exists.is_none() {
                return Err(AppError::Validation("replyToMessageId does not exist".into()));
            }
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        sqlx::query(
            "INSERT INTO group_messages (id, group_id, sender_user_id, sender_device_id, ciphertext, proto, group_epoch, reply_to_id, created_at, client_message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message_id)
        .bind(group_id)
        .bind(sender_user_id)
        .bind(sender_device_id)
        .bind(&ciphertext)
        .bind(proto)
        .bind(group.group_epoch)
        .bind(&reply_to_id)
        .bind(now)
        .bind(&client_message_id)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        let recipients: Vec<i64> = sqlx::query_scalar(
            "SELECT user_id FROM group_participants WHERE group_id = ? AND is_banned = 0 AND user_id != ?",
        )
        .bind(group_id)
        .bind(sender_user_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        for recipient in &recipients {
            sqlx::query("INSERT INTO group_deliveries (message_id, recipient_user_id) VALUES (?, ?)")
                .bind(&message_id)
                .bind(recipient)
                .execute(&mut *tx)
                .await
                .map_err(anyhow::Error::from)?;
        }

        tx.commit().await.map_err(anyhow::Error::from)?;

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope { surface: SURFACE, sender_id: sender_user_id, client_message_id: cid.clone(), secondary_key: Some(group_id.to_string()) };
            if let Err(err) = self.idempotency.record(&scope, &message_id).await {
                let sqlx_err = err.downcast::<sqlx::Error>().map_err(AppError::Internal)?;
                if !IdempotencyGate::is_unique_violation(&sqlx_err) {
                    return Err(AppError::Internal(sqlx_err.into()));
                }
            }
        }

        let payload = serde_json::json!({
            "type": "group_message",
            "group_id": group_id,
            "message_id": message_id,
            "sender_user_id": sender_user_id,
            "sender_device_id": sender_device_id,
            "ciphertext": ciphertext_b64,
            "proto": proto,
            "group_epoch": group.group_epoch,
            "reply_to_message_id": reply_to_id,
            "created_at": now,
        });
        let uuid = uuid::Uuid::parse_str(group_id).unwrap_or_else(|_| uuid::Uuid::nil());
        let channel = keys::group_channel(uuid);
        let _ = self.events.publish(&channel, &ChatEvent::GroupMessage { group_id: uuid, message: payload }).await;

        Ok(SendResult { message_id, group_epoch: group.group_epoch, created_at: now, duplicate: false })
    }

    pub async fn messages(&self, group_id: &str, caller_id: i64, limit: u32, before: Option<DateTime<Utc>>) -> AppResult<Vec<MessageView>> {
        self.require_active_member(group_id, caller_id).await?;
        let limit = limit.clamp(1, 200) as i64;

        #[derive(sqlx::FromRow)]
        struct Row {
            id: String,
            sender_user_id: i64,
            sender_device_id: String,
            ciphertext: Vec<u8>,
            proto: String,
            group_epoch: i64,
            reply_to_id: Option<String>,
            created_at: DateTime<Utc>,
        }

        let rows: Vec<Row> = if let Some(before) = before {
            sqlx::query_as(
                "SELECT id, sender_user_id, sender_device_id, ciphertext, proto, group_epoch, reply_to_id, created_at
                 FROM group_messages WHERE group_id = ? AND created_at < ? ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(group_id)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(anyhow::Error::from)?
        } else {
            sqlx::query_as(
                "SELECT id, sender_user_id, sender_device_id, ciphertext, proto, group_epoch, reply_to_id, created_at
                 FROM group_messages WHERE group_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(group_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(anyhow::Error::from)?
        };

        Ok(rows
            .into_iter()
            .map(|r| MessageView {
                id: r.id,
                group_id: group_id.to_string(),
                sender_user_id: r.sender_user_id,
                sender_device_id: r.sender_device_id,
                ciphertext: B64.encode(r.ciphertext),
                proto: r.proto,
                group_epoch: r.group_epoch,
                reply_to_id: r.reply_to_id,
                created_at: r.created_at,
            })
            .collect())
    }

    pub async fn list_groups(&self, user_id: i64) -> AppResult<Vec<GroupView>> {
        let rows: Vec<GroupRow> = sqlx::query_as(
            "SELECT g.id, g.title, g.about, g.photo_url, g.created_by, g.max_participants, g.group_epoch, g.is_closed, g.updated_at
             FROM groups g JOIN group_participants p ON p.group_id = g.id
             WHERE p.user_id = ? AND p.is_banned = 0 ORDER BY g.updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(self.view_of(row).await?);
        }
        Ok(views)
    }

    fn generate_code() -> String {
        let mut rng = rand::rng();
        (0..12).map(|_| INVITE_ALPHABET[rng.random_range(0..INVITE_ALPHABET.len())] as char).collect()
    }

    pub async fn create_invite(
        &self,
        group_id: &str,
        caller_id: i64,
        invite_type: &str,
        max_uses: Option<i64>,
        target_user_id: Option<i64>,
    ) -> AppResult<InviteView> {
        self.require_enabled()?;
        let role = self.require_active_member(group_id, caller_id).await?;
        if !role.can_manage_members() {
            return Err(AppError::authz("only owners and admins may create invites"));
        }
        if invite_type == "direct" && target_user_id.is_none() {
            return Err(AppError::Validation("targetUserId is required for direct invites".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let code = Self::generate_code();
        let expires_at = Utc::now() + chrono::Duration::hours(self.config.invite_expiry_hours);

        sqlx::query(
            "INSERT INTO group_invites (id, group_id, created_by, invite_type, code, expires_at, max_uses, uses, target_user_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(group_id)
        .bind(caller_id)
        .bind(invite_type)
        .bind(&code)
        .bind(expires_at)
        .bind(max_uses)
        .bind(target_user_id)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(InviteView { id, code, invite_type: invite_type.to_string(), expires_at, max_uses, uses: 0, target_user_id })
    }

    /// Joining an invite has no SQLite row-lock primitive, so the check and
    /// the increment happen inside one transaction: the transaction's
    /// exclusive hold on the `group_invites` row is what the spec's
    /// `SELECT ... FOR UPDATE` maps to on this backend.
    pub async fn join_by_invite(&self, code: &str, user_id: i64) -> AppResult<GroupView> {
        self.require_enabled()?;

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;

        #[derive(sqlx::FromRow)]
        struct InviteRow {
            group_id: String,
            invite_type: String,
            expires_at: DateTime<Utc>,
            max_uses: Option<i64>,
            uses: i64,
            target_user_id: Option<i64>,
        }

        let invite: InviteRow = sqlx::query_as(
            "SELECT group_id, invite_type, expires_at, max_uses, uses, target_user_id FROM group_invites WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound("invite not found".into()))?;

        if invite.expires_at < Utc::now() {
            return Err(AppError::Conflict { code: "INVITE_EXPIRED", message: "invite has expired".into(), header: None });
        }
        if let Some(max) = invite.max_uses {
            if invite.uses >= max {
                return Err(AppError::Conflict { code: "INVITE_EXHAUSTED", message: "invite has no uses remaining".into(), header: None });
            }
        }
        if invite.invite_type == "direct" && invite.target_user_id != Some(user_id) {
            return Err(AppError::authz("this invite is not addressed to you"));
        }

        let banned: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM group_bans WHERE group_id = ? AND user_id = ?",
        )
        .bind(&invite.group_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;
        if banned.is_some() {
            return Err(AppError::authz("banned from this group"));
        }

        let group = sqlx::query_as::<_, GroupRow>(
            "SELECT id, title, about, photo_url, created_by, max_participants, group_epoch, is_closed, updated_at
             FROM groups WHERE id = ?",
        )
        .bind(&invite.group_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound("group not found".into()))?;

        let current: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_participants WHERE group_id = ? AND is_banned = 0",
        )
        .bind(&invite.group_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;
        if current >= group.max_participants {
            return Err(AppError::group_full());
        }

        sqlx::query(
            "INSERT INTO group_participants (group_id, user_id, role) VALUES (?, ?, 'member')
             ON CONFLICT(group_id, user_id) DO UPDATE SET is_banned = 0",
        )
        .bind(&invite.group_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        sqlx::query("UPDATE group_invites SET uses = uses + 1 WHERE code = ?")
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;

        let new_epoch = Self::bump_epoch(&mut tx, &invite.group_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;
        self.publish_epoch_change(&invite.group_id, new_epoch, "invite_join").await;

        let row = self.fetch_group(&invite.group_id).await?;
        self.view_of(row).await
    }

    async fn created_at_of(&self, message_id: &str) -> AppResult<DateTime<Utc>> {
        let created_at: DateTime<Utc> = sqlx::query_scalar("SELECT created_at FROM group_messages WHERE id = ?")
            .bind(message_id)
            .fetch_one(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::e2ee::E2EEConfig;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::ensure_schema(&pool).await.unwrap();
        pool
    }

    async fn test_pipeline(pool: SqlitePool) -> GroupPipeline {
        let events = Arc::new(EventBus::disabled());
        let registry = Arc::new(E2EEKeyRegistry::new(pool.clone(), E2EEConfig::from_env()));
        let rl = TieredRateLimiter::new("group", 60, 8, StdDuration::from_secs(5), None);
        GroupPipeline::new(pool, GroupsConfig::from_env(), rl, events, registry)
    }

    #[tokio::test]
    async fn adding_member_bumps_epoch_monotonically() {
        let pool = test_pool().await;
        let pipeline = test_pipeline(pool).await;
        let group = pipeline.create_group(1, "Test Group", None, None).await.unwrap();
        assert_eq!(group.group_epoch, 0);

        let after_add = pipeline.add_member(&group.id, 1, 2).await.unwrap();
        assert_eq!(after_add.group_epoch, 1);

        let after_ban = pipeline.ban_member(&group.id, 1, 2, Some("spam".into())).await.unwrap();
        assert_eq!(after_ban.group_epoch, 2);
    }

    #[tokio::test]
    async fn group_full_rejects_additional_members() {
        let pool = test_pool().await;
        let pipeline = test_pipeline(pool).await;
        let mut config = GroupsConfig::from_env();
        config.max_participants = 1;
        let pipeline = GroupPipeline { config, ..pipeline };
        let group = pipeline.create_group(1, "Tiny", None, None).await.unwrap();
        let err = pipeline.add_member(&group.id, 1, 2).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict { code: "GROUP_FULL", .. }));
    }

    #[tokio::test]
    async fn owner_cannot_be_removed() {
        let pool = test_pool().await;
        let pipeline = test_pipeline(pool).await;
        let group = pipeline.create_group(1, "Owned", None, None).await.unwrap();
        let err = pipeline.remove_member(&group.id, 1, 1).await.unwrap_err();
        assert!(matches!(err, AppError::Authz { .. }));
    }

    #[tokio::test]
    async fn send_rejects_oversized_ciphertext() {
        let pool = test_pool().await;
        let mut e2ee_config = E2EEConfig::from_env();
        e2ee_config.max_message_size_bytes = 4;
        let registry = Arc::new(E2EEKeyRegistry::new(pool.clone(), e2ee_config));
        registry
            .upload_bundle("dev-1", 1, None, "identity", "spk-pub", "spk-sig", &[(1, "p1".into())])
            .await
            .unwrap();

        let events = Arc::new(EventBus::disabled());
        let rl = TieredRateLimiter::new("group", 60, 8, StdDuration::from_secs(5), None);
        let pipeline = GroupPipeline::new(pool, GroupsConfig::from_env(), rl, events, registry);

        let group = pipeline.create_group(1, "Oversized", None, None).await.unwrap();
        let cipher = B64.encode(b"too-long-payload");

        let err = pipeline
            .send(&group.id, 1, "dev-1", group.group_epoch, &cipher, "proto-v1", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
