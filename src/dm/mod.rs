// src/dm/mod.rs (C10 DMPipeline)
//
// Per-pair encrypted conversations. The server stores and relays opaque
// ciphertext only; `proto` and `ciphertext` are never inspected. Ordering
// within one conversation is preserved because every insert contends for
// the same `dm_conversations.last_message_at` row update.

use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::chat::block::BlockRepo;
use crate::config::e2ee::E2EEConfig;
use crate::e2ee::E2EEKeyRegistry;
use crate::error::{AppError, AppResult};
use crate::events::{keys, ChatEvent, EventBus};
use crate::idempotency::{IdempotencyGate, IdempotencyScope};
use crate::rate_limit::TieredRateLimiter;

const SURFACE: &str = "dm";
const B64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ConversationRow {
    id: String,
    pair_key: String,
    created_at: DateTime<Utc>,
    last_message_at: Option<DateTime<Utc>>,
    sealed_sender_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ParticipantView {
    pub user_id: i64,
    pub device_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversationView {
    pub id: String,
    pub participants: Vec<ParticipantView>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub sealed_sender_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct SendResult {
    pub message_id: String,
    pub created_at: DateTime<Utc>,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sender_user_id: i64,
    pub sender_device_id: String,
    pub ciphertext: String,
    pub proto: String,
    pub created_at: DateTime<Utc>,
}

pub struct DMPipeline {
    pool: SqlitePool,
    config: E2EEConfig,
    idempotency: IdempotencyGate,
    rate_limiter: TieredRateLimiter,
    events: Arc<EventBus>,
    blocks: BlockRepo,
    registry: Arc<E2EEKeyRegistry>,
}

impl DMPipeline {
    pub fn new(
        pool: SqlitePool,
        config: E2EEConfig,
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

    fn pair_key(a: i64, b: i64) -> String {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        format!("{lo}:{hi}")
    }

    async fn active_device_ids(&self, user_id: i64) -> AppResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT device_id FROM e2ee_devices WHERE user_id = ? AND status = 'active'",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(ids)
    }

    pub async fn create_conversation(&self, user_id: i64, peer_user_id: i64) -> AppResult<ConversationView> {
        if !self.config.enabled {
            return Err(AppError::FeatureDisabled);
        }
        if user_id == peer_user_id {
            return Err(AppError::Validation("cannot DM yourself".into()));
        }
        if self.blocks.is_blocked_either_direction(user_id, peer_user_id).await.map_err(AppError::Internal)? {
            return Err(AppError::Blocked);
        }

        let pair_key = Self::pair_key(user_id, peer_user_id);

        let existing: Option<ConversationRow> = sqlx::query_as(
            "SELECT id, pair_key, created_at, last_message_at, sealed_sender_enabled FROM dm_conversations WHERE pair_key = ?",
        )
        .bind(&pair_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let row = match existing {
            Some(row) => row,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO dm_conversations (id, pair_key, sealed_sender_enabled) VALUES (?, ?, 0)
                     ON CONFLICT(pair_key) DO NOTHING",
                )
                .bind(&id)
                .bind(&pair_key)
                .execute(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;

                let row: ConversationRow = sqlx::query_as(
                    "SELECT id, pair_key, created_at, last_message_at, sealed_sender_enabled FROM dm_conversations WHERE pair_key = ?",
                )
                .bind(&pair_key)
                .fetch_one(&self.pool)
                .await
                .map_err(anyhow::Error::from)?;

                for uid in [user_id, peer_user_id] {
                    let device_ids = self.active_device_ids(uid).await?;
                    let encoded = serde_json::to_string(&device_ids).map_err(anyhow::Error::from)?;
                    sqlx::query(
                        "INSERT INTO dm_participants (conversation_id, user_id, device_ids) VALUES (?, ?, ?)
                         ON CONFLICT(conversation_id, user_id) DO UPDATE SET device_ids = excluded.device_ids",
                    )
                    .bind(&row.id)
                    .bind(uid)
                    .bind(encoded)
                    .execute(&self.pool)
                    .await
                    .map_err(anyhow::Error::from)?;
                }

                row
            }
        };

        self.hydrate(row).await
    }

    async fn hydrate(&self, row: ConversationRow) -> AppResult<ConversationView> {
        #[derive(sqlx::FromRow)]
        struct PRow {
            user_id: i64,
            device_ids: String,
        }
        let participants: Vec<PRow> = sqlx::query_as(
            "SELECT user_id, device_ids FROM dm_participants WHERE conversation_id = ?",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(ConversationView {
            id: row.id,
            participants: participants
                .into_iter()
                .map(|p| ParticipantView {
                    user_id: p.user_id,
                    device_ids: serde_json::from_str(&p.device_ids).unwrap_or_default(),
                })
                .collect(),
            created_at: row.created_at,
            last_message_at: row.last_message_at,
            sealed_sender_enabled: row.sealed_sender_enabled,
        })
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> AppResult<ConversationRow> {
        sqlx::query_as(
            "SELECT id, pair_key, created_at, last_message_at, sealed_sender_enabled FROM dm_conversations WHERE id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::NotFound("conversation not found".into()))
    }

    async fn require_participant(&self, conversation_id: &str, user_id: i64) -> AppResult<()> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM dm_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        row.ok_or_else(|| AppError::authz("not a participant in this conversation")).map(|_| ())
    }

    async fn other_participant(&self, conversation_id: &str, user_id: i64) -> AppResult<i64> {
        sqlx::query_scalar(
            "SELECT user_id FROM dm_participants WHERE conversation_id = ? AND user_id != ?",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("dm conversation {conversation_id} missing peer")))
    }

    pub async fn send(
        &self,
        conversation_id: &str,
        sender_user_id: i64,
        sender_device_id: &str,
        ciphertext_b64: &str,
        proto: &str,
        client_message_id: Option<String>,
    ) -> AppResult<SendResult> {
        if !self.config.enabled {
            return Err(AppError::FeatureDisabled);
        }
        self.require_participant(conversation_id, sender_user_id).await?;
        self.registry.require_active_device(sender_device_id, sender_user_id).await?;

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope { surface: SURFACE, sender_id: sender_user_id, client_message_id: cid.clone(), secondary_key: Some(conversation_id.to_string()) };
            if let Some(existing_id) = self.idempotency.check(&scope).await? {
                let created_at = self.created_at_of(&existing_id).await?;
                return Ok(SendResult { message_id: existing_id, created_at, duplicate: true });
            }
        }

        let ciphertext = B64
            .decode(ciphertext_b64)
            .map_err(|_| AppError::Validation("ciphertext is not valid base64".into()))?;
        if ciphertext.len() > self.config.max_message_size_bytes {
            return Err(AppError::Validation("ciphertext exceeds max message size".into()));
        }

        let rl_key = keys::rate_limit_key(SURFACE, sender_user_id);
        let result = self.rate_limiter.check(&rl_key).await;
        if !result.allowed {
            return Err(AppError::RateLimited { retry_after_seconds: result.retry_after_seconds });
        }

        let recipient_id = self.other_participant(conversation_id, sender_user_id).await?;
        if self.blocks.is_blocked_either_direction(sender_user_id, recipient_id).await.map_err(AppError::Internal)? {
            return Err(AppError::Blocked);
        }

        let message_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        sqlx::query(
            "INSERT INTO dm_messages (id, conversation_id, sender_user_id, sender_device_id, ciphertext, proto, created_at, client_message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message_id)
        .bind(conversation_id)
        .bind(sender_user_id)
        .bind(sender_device_id)
        .bind(&ciphertext)
        .bind(proto)
        .bind(now)
        .bind(&client_message_id)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        sqlx::query("INSERT INTO dm_deliveries (message_id, recipient_user_id) VALUES (?, ?)")
            .bind(&message_id)
            .bind(recipient_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;

        sqlx::query("UPDATE dm_conversations SET last_message_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;

        tx.commit().await.map_err(anyhow::Error::from)?;

        if let Some(ref cid) = client_message_id {
            let scope = IdempotencyScope { surface: SURFACE, sender_id: sender_user_id, client_message_id: cid.clone(), secondary_key: Some(conversation_id.to_string()) };
            if let Err(err) = self.idempotency.record(&scope, &message_id).await {
                let sqlx_err = err.downcast::<sqlx::Error>().map_err(AppError::Internal)?;
                if !IdempotencyGate::is_unique_violation(&sqlx_err) {
                    return Err(AppError::Internal(sqlx_err.into()));
                }
            }
        }

        let payload = serde_json::json!({
            "type": "dm",
            "message_id": message_id,
            "conversation_id": conversation_id,
            "sender_user_id": sender_user_id,
            "sender_device_id": sender_device_id,
            "ciphertext": ciphertext_b64,
            "proto": proto,
            "created_at": now,
        });
        let _ = self.events.publish(&keys::dm_channel(recipient_id), &ChatEvent::Dm { message: payload }).await;

        Ok(SendResult { message_id, created_at: now, duplicate: false })
    }

    pub async fn messages(&self, conversation_id: &str, caller_id: i64, limit: u32, since: Option<DateTime<Utc>>) -> AppResult<Vec<MessageView>> {
        self.require_participant(conversation_id, caller_id).await?;
        let limit = limit.clamp(1, 200) as i64;

        #[derive(sqlx::FromRow)]
        struct Row {
            id: String,
            sender_user_id: i64,
            sender_device_id: String,
            ciphertext: Vec<u8>,
            proto: String,
            created_at: DateTime<Utc>,
        }

        let rows: Vec<Row> = if let Some(since) = since {
            sqlx::query_as(
                "SELECT id, sender_user_id, sender_device_id, ciphertext, proto, created_at FROM dm_messages
                 WHERE conversation_id = ? AND created_at > ? ORDER BY created_at, id LIMIT ?",
            )
            .bind(conversation_id)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(anyhow::Error::from)?
        } else {
            sqlx::query_as(
                "SELECT id, sender_user_id, sender_device_id, ciphertext, proto, created_at FROM dm_messages
                 WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(conversation_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(anyhow::Error::from)?
        };

        Ok(rows
            .into_iter()
            .map(|r| MessageView {
                id: r.id,
                conversation_id: conversation_id.to_string(),
                sender_user_id: r.sender_user_id,
                sender_device_id: r.sender_device_id,
                ciphertext: B64.encode(r.ciphertext),
                proto: r.proto,
                created_at: r.created_at,
            })
            .collect())
    }

    pub async fn list_conversations(&self, user_id: i64) -> AppResult<Vec<ConversationView>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            "SELECT c.id, c.pair_key, c.created_at, c.last_message_at, c.sealed_sender_enabled
             FROM dm_conversations c JOIN dm_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ? ORDER BY COALESCE(c.last_message_at, c.created_at) DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            views.push(self.hydrate(row).await?);
        }
        Ok(views)
    }

    pub async fn conversation_detail(&self, conversation_id: &str, user_id: i64) -> AppResult<ConversationView> {
        self.require_participant(conversation_id, user_id).await?;
        let row = self.fetch_conversation(conversation_id).await?;
        self.hydrate(row).await
    }

    /// Forward-only `sent -> delivered`; only the named recipient may mark it.
    pub async fn mark_delivered(&self, message_id: &str, recipient_id: i64) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE dm_deliveries SET delivered_at = ? WHERE message_id = ? AND recipient_user_id = ? AND delivered_at IS NULL",
        )
        .bind(Utc::now())
        .bind(message_id)
        .bind(recipient_id)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        if result.rows_affected() == 0 {
            self.ensure_recipient_row_exists(message_id, recipient_id).await?;
        }
        Ok(())
    }

    /// Forward-only `delivered -> read` (also reachable directly from
    /// `sent`, per the spec's allowed transition set).
    pub async fn mark_read(&self, message_id: &str, recipient_id: i64) -> AppResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE dm_deliveries SET delivered_at = COALESCE(delivered_at, ?), read_at = ?
             WHERE message_id = ? AND recipient_user_id = ? AND read_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(message_id)
        .bind(recipient_id)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        if result.rows_affected() == 0 {
            self.ensure_recipient_row_exists(message_id, recipient_id).await?;
        }
        Ok(())
    }

    async fn ensure_recipient_row_exists(&self, message_id: &str, recipient_id: i64) -> AppResult<()> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM dm_deliveries WHERE message_id = ? AND recipient_user_id = ?",
        )
        .bind(message_id)
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        if row.is_none() {
            return Err(AppError::authz("caller is not the recipient of this message"));
        }
        Ok(())
    }

    async fn created_at_of(&self, message_id: &str) -> AppResult<DateTime<Utc>> {
        let created_at: DateTime<Utc> = sqlx::query_scalar("SELECT created_at FROM dm_messages WHERE id = ?")
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
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::ensure_schema(&pool).await.unwrap();
        pool
    }

    async fn test_pipeline(pool: SqlitePool) -> (DMPipeline, Arc<E2EEKeyRegistry>) {
        let registry = Arc::new(E2EEKeyRegistry::new(pool.clone(), E2EEConfig::from_env()));
        let events = Arc::new(EventBus::disabled());
        let rl = TieredRateLimiter::new("dm", 60, 8, StdDuration::from_secs(5), None);
        let pipeline = DMPipeline::new(pool, E2EEConfig::from_env(), rl, events, registry.clone());
        (pipeline, registry)
    }

    async fn register_device(registry: &E2EEKeyRegistry, device_id: &str, user_id: i64) {
        registry
            .upload_bundle(device_id, user_id, None, "identity", "spk-pub", "spk-sig", &[(1, "p1".into())])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_conversation_is_idempotent_regardless_of_initiator() {
        let pool = test_pool().await;
        let (pipeline, _registry) = test_pipeline(pool).await;

        let a_first = pipeline.create_conversation(1, 2).await.unwrap();
        let b_first = pipeline.create_conversation(2, 1).await.unwrap();
        assert_eq!(a_first.id, b_first.id);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dm_conversations")
            .fetch_one(&pipeline.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn send_with_same_client_message_id_returns_same_message_once() {
        let pool = test_pool().await;
        let (pipeline, registry) = test_pipeline(pool).await;
        register_device(&registry, "dev-1", 1).await;
        register_device(&registry, "dev-2", 2).await;

        let conv = pipeline.create_conversation(1, 2).await.unwrap();
        let cipher = base64::engine::general_purpose::STANDARD.encode(b"hello");

        let first = pipeline
            .send(&conv.id, 1, "dev-1", &cipher, "proto-v1", Some("cid-1".into()))
            .await
            .unwrap();
        assert!(!first.duplicate);

        let second = pipeline
            .send(&conv.id, 1, "dev-1", &cipher, "proto-v1", Some("cid-1".into()))
            .await
            .unwrap();
        assert!(second.duplicate);
        assert_eq!(first.message_id, second.message_id);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dm_messages WHERE conversation_id = ?")
            .bind(&conv.id)
            .fetch_one(&pipeline.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn send_rejects_oversized_ciphertext() {
        let pool = test_pool().await;
        let mut config = E2EEConfig::from_env();
        config.max_message_size_bytes = 4;
        let registry = Arc::new(E2EEKeyRegistry::new(pool.clone(), config.clone()));
        let events = Arc::new(EventBus::disabled());
        let rl = TieredRateLimiter::new("dm", 60, 8, StdDuration::from_secs(5), None);
        let pipeline = DMPipeline::new(pool, config, rl, events, registry.clone());
        register_device(&registry, "dev-1", 1).await;
        register_device(&registry, "dev-2", 2).await;

        let conv = pipeline.create_conversation(1, 2).await.unwrap();
        let cipher = base64::engine::general_purpose::STANDARD.encode(b"too-long-payload");

        let err = pipeline.send(&conv.id, 1, "dev-1", &cipher, "proto-v1", None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn send_from_revoked_device_is_rejected() {
        let pool = test_pool().await;
        let (pipeline, registry) = test_pipeline(pool).await;
        register_device(&registry, "dev-1", 1).await;
        register_device(&registry, "dev-2", 2).await;
        registry.revoke_device("dev-1", 1, "lost phone").await.unwrap();

        let conv = pipeline.create_conversation(1, 2).await.unwrap();
        let cipher = base64::engine::general_purpose::STANDARD.encode(b"hi");
        let err = pipeline.send(&conv.id, 1, "dev-1", &cipher, "proto-v1", None).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict { code: "DEVICE_REVOKED", .. }));
    }

    #[tokio::test]
    async fn mark_delivered_then_read_is_forward_only_and_idempotent() {
        let pool = test_pool().await;
        let (pipeline, registry) = test_pipeline(pool).await;
        register_device(&registry, "dev-1", 1).await;
        register_device(&registry, "dev-2", 2).await;

        let conv = pipeline.create_conversation(1, 2).await.unwrap();
        let cipher = base64::engine::general_purpose::STANDARD.encode(b"hi");
        let sent = pipeline.send(&conv.id, 1, "dev-1", &cipher, "proto-v1", None).await.unwrap();

        pipeline.mark_delivered(&sent.message_id, 2).await.unwrap();
        pipeline.mark_delivered(&sent.message_id, 2).await.unwrap();
        pipeline.mark_read(&sent.message_id, 2).await.unwrap();
        pipeline.mark_read(&sent.message_id, 2).await.unwrap();

        let row: (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT delivered_at, read_at FROM dm_deliveries WHERE message_id = ? AND recipient_user_id = 2",
        )
        .bind(&sent.message_id)
        .fetch_one(&pipeline.pool)
        .await
        .unwrap();
        assert!(row.0.is_some());
        assert!(row.1.is_some());
    }

    #[tokio::test]
    async fn blocked_pair_cannot_create_conversation_or_send() {
        let pool = test_pool().await;
        let blocks = BlockRepo::new(pool.clone());
        blocks.block(1, 2).await.unwrap();
        let (pipeline, _registry) = test_pipeline(pool).await;

        let err = pipeline.create_conversation(2, 1).await.unwrap_err();
        assert!(matches!(err, AppError::Blocked));
    }
}
