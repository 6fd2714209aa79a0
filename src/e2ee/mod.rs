// src/e2ee/mod.rs (C9 E2EEKeyRegistry)
//
// Device lifecycle, key bundle upload/fetch, one-time prekey pool with
// atomic claim, and the identity-key-change alert/block policy. Ciphertext
// itself never passes through this module — only the key material peers
// need to establish a session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::chat::block::BlockRepo;
use crate::config::e2ee::E2EEConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Revoked,
}

impl DeviceStatus {
    fn from_str(s: &str) -> Self {
        if s == "revoked" { Self::Revoked } else { Self::Active }
    }
}

#[derive(Debug, Serialize)]
pub struct BundleSummary {
    pub device_id: String,
    pub bundle_version: i64,
    pub prekeys_remaining: i64,
}

#[derive(Debug, Serialize)]
pub struct DeviceBundleView {
    pub device_id: String,
    pub device_name: Option<String>,
    pub identity_key_pub: String,
    pub signed_prekey_pub: String,
    pub signed_prekey_sig: String,
    pub bundle_version: i64,
    pub prekeys_remaining: i64,
}

#[derive(Debug, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub device_name: Option<String>,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ClaimedPrekey {
    pub prekey_id: i64,
    pub prekey_pub: String,
}

pub struct E2EEKeyRegistry {
    pool: SqlitePool,
    config: E2EEConfig,
    blocks: BlockRepo,
}

impl E2EEKeyRegistry {
    pub fn new(pool: SqlitePool, config: E2EEConfig) -> Self {
        Self { blocks: BlockRepo::new(pool.clone()), pool, config }
    }

    /// Ciphertext byte-length cap shared with any caller that needs to
    /// enforce it on decoded payloads outside this module (group sends use
    /// the same `E2EEMaxMessageSize` knob as DM sends).
    pub fn max_message_size_bytes(&self) -> usize {
        self.config.max_message_size_bytes
    }

    async fn device_owner(&self, device_id: &str) -> AppResult<Option<(i64, String)>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT user_id, status FROM e2ee_devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(row)
    }

    pub async fn require_active_device(&self, device_id: &str, expected_owner: i64) -> AppResult<()> {
        let (owner, status) = self
            .device_owner(device_id)
            .await?
            .ok_or_else(|| AppError::NotFound("device not found".into()))?;
        if owner != expected_owner {
            return Err(AppError::authz("device does not belong to caller"));
        }
        if DeviceStatus::from_str(&status) == DeviceStatus::Revoked {
            return Err(AppError::device_revoked());
        }
        Ok(())
    }

    /// Per-device upsert of identity/signed-prekey material plus a fresh
    /// one-time-prekey pool. Runs the identity-change policy when the
    /// device already has a stored bundle with a different identity key.
    pub async fn upload_bundle(
        &self,
        device_id: &str,
        user_id: i64,
        device_name: Option<&str>,
        identity_key_pub: &str,
        signed_prekey_pub: &str,
        signed_prekey_sig: &str,
        one_time_prekeys: &[(i64, String)],
    ) -> AppResult<BundleSummary> {
        if !self.config.enabled {
            return Err(AppError::FeatureDisabled);
        }
        if one_time_prekeys.is_empty() {
            return Err(AppError::Validation("at least one one-time prekey is required".into()));
        }
        if one_time_prekeys.len() > self.config.prekey_pool_size {
            return Err(AppError::Validation(format!(
                "prekey pool exceeds cap of {}",
                self.config.prekey_pool_size
            )));
        }

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;

        sqlx::query(
            "INSERT INTO e2ee_devices (device_id, user_id, device_name, status)
             VALUES (?, ?, ?, 'active')
             ON CONFLICT(device_id) DO UPDATE SET device_name = excluded.device_name",
        )
        .bind(device_id)
        .bind(user_id)
        .bind(device_name)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        let existing: Option<(String, i64)> = sqlx::query_as(
            "SELECT identity_key_pub, bundle_version FROM e2ee_key_bundles WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        let next_version = match existing {
            None => 1,
            Some((ref stored_identity, version)) => {
                if stored_identity != identity_key_pub {
                    self.apply_identity_change_policy(&mut tx, device_id).await?;
                }
                version + 1
            }
        };

        sqlx::query(
            "INSERT INTO e2ee_key_bundles (device_id, identity_key_pub, signed_prekey_pub, signed_prekey_sig, bundle_version, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET
               identity_key_pub = excluded.identity_key_pub,
               signed_prekey_pub = excluded.signed_prekey_pub,
               signed_prekey_sig = excluded.signed_prekey_sig,
               bundle_version = excluded.bundle_version,
               updated_at = excluded.updated_at",
        )
        .bind(device_id)
        .bind(identity_key_pub)
        .bind(signed_prekey_pub)
        .bind(signed_prekey_sig)
        .bind(next_version)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::from)?;

        sqlx::query("DELETE FROM e2ee_one_time_prekeys WHERE device_id = ? AND claimed = 0")
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;

        for (prekey_id, prekey_pub) in one_time_prekeys {
            sqlx::query(
                "INSERT INTO e2ee_one_time_prekeys (device_id, prekey_id, prekey_pub, claimed)
                 VALUES (?, ?, ?, 0)
                 ON CONFLICT(device_id, prekey_id) DO UPDATE SET prekey_pub = excluded.prekey_pub, claimed = 0",
            )
            .bind(device_id)
            .bind(prekey_id)
            .bind(prekey_pub)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::from)?;
        }

        tx.commit().await.map_err(anyhow::Error::from)?;

        let remaining = self.prekeys_remaining(device_id).await?;
        Ok(BundleSummary { device_id: device_id.to_string(), bundle_version: next_version, prekeys_remaining: remaining })
    }

    /// `N = count_before + 1`. Block threshold revokes the device and
    /// returns an error; alert threshold logs but still accepts.
    async fn apply_identity_change_policy(&self, tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, device_id: &str) -> AppResult<()> {
        let count_before: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM e2ee_device_revocations WHERE device_id = ? AND reason = 'identity_change'",
        )
        .bind(device_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(anyhow::Error::from)?;
        let n = count_before + 1;

        if n >= self.config.identity_change_block_threshold as i64 {
            sqlx::query("UPDATE e2ee_devices SET status = 'revoked' WHERE device_id = ?")
                .bind(device_id)
                .execute(&mut **tx)
                .await
                .map_err(anyhow::Error::from)?;
            sqlx::query("INSERT INTO e2ee_device_revocations (device_id, reason) VALUES (?, 'identity_change_block')")
                .bind(device_id)
                .execute(&mut **tx)
                .await
                .map_err(anyhow::Error::from)?;
            return Err(AppError::identity_change_blocked());
        }

        if n >= self.config.identity_change_alert_threshold as i64 {
            tracing::warn!(device_id, count = n, "identity key changed repeatedly, alert threshold reached");
        }

        sqlx::query("INSERT INTO e2ee_device_revocations (device_id, reason) VALUES (?, 'identity_change')")
            .bind(device_id)
            .execute(&mut **tx)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn prekeys_remaining(&self, device_id: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM e2ee_one_time_prekeys WHERE device_id = ? AND claimed = 0",
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(count)
    }

    /// Self-reads are exempt from the relationship gate; everyone else must
    /// already share a DM conversation with the target and must not be
    /// blocked in either direction.
    pub async fn fetch_bundle(
        &self,
        caller_id: i64,
        target_user_id: i64,
        known_bundle_version: Option<i64>,
    ) -> AppResult<Vec<DeviceBundleView>> {
        if caller_id != target_user_id {
            if self.blocks.is_blocked_either_direction(caller_id, target_user_id).await.map_err(AppError::Internal)? {
                return Err(AppError::Blocked);
            }
            if !self.shares_dm_conversation(caller_id, target_user_id).await? {
                return Err(AppError::relationship_required());
            }
        }

        let device_ids: Vec<String> = sqlx::query_scalar(
            "SELECT device_id FROM e2ee_devices WHERE user_id = ? AND status = 'active'",
        )
        .bind(target_user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let mut views = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            let Some(bundle) = self.fetch_one_bundle(&device_id).await? else { continue };

            if let Some(known) = known_bundle_version {
                if bundle.bundle_version > known {
                    return Err(AppError::bundle_stale(bundle.bundle_version));
                }
            }
            views.push(bundle);
        }

        Ok(views)
    }

    async fn fetch_one_bundle(&self, device_id: &str) -> AppResult<Option<DeviceBundleView>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            identity_key_pub: String,
            signed_prekey_pub: String,
            signed_prekey_sig: String,
            bundle_version: i64,
            device_name: Option<String>,
        }

        let row: Option<Row> = sqlx::query_as(
            "SELECT kb.identity_key_pub, kb.signed_prekey_pub, kb.signed_prekey_sig, kb.bundle_version, d.device_name
             FROM e2ee_key_bundles kb JOIN e2ee_devices d ON d.device_id = kb.device_id
             WHERE kb.device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        let Some(row) = row else { return Ok(None) };
        let remaining = self.prekeys_remaining(device_id).await?;

        Ok(Some(DeviceBundleView {
            device_id: device_id.to_string(),
            device_name: row.device_name,
            identity_key_pub: row.identity_key_pub,
            signed_prekey_pub: row.signed_prekey_pub,
            signed_prekey_sig: row.signed_prekey_sig,
            bundle_version: row.bundle_version,
            prekeys_remaining: remaining,
        }))
    }

    async fn shares_dm_conversation(&self, a: i64, b: i64) -> AppResult<bool> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM dm_participants p1
             JOIN dm_participants p2 ON p1.conversation_id = p2.conversation_id
             WHERE p1.user_id = ? AND p2.user_id = ? LIMIT 1",
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(row.is_some())
    }

    /// Conditional claim: `UPDATE ... WHERE claimed = 0 RETURNING id`. Since
    /// the caller does not pick a specific prekey, this selects the lowest
    /// unclaimed id and claims it in one statement to avoid a second racer
    /// stealing it between select and update.
    pub async fn claim_prekey(&self, device_id: &str) -> AppResult<ClaimedPrekey> {
        let (_, status) = self
            .device_owner(device_id)
            .await?
            .ok_or_else(|| AppError::NotFound("device not found".into()))?;
        if DeviceStatus::from_str(&status) == DeviceStatus::Revoked {
            return Err(AppError::device_revoked());
        }

        loop {
            let candidate: Option<(i64, String)> = sqlx::query_as(
                "SELECT prekey_id, prekey_pub FROM e2ee_one_time_prekeys
                 WHERE device_id = ? AND claimed = 0 ORDER BY prekey_id LIMIT 1",
            )
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

            let Some((prekey_id, prekey_pub)) = candidate else {
                let version: i64 = sqlx::query_scalar(
                    "SELECT bundle_version FROM e2ee_key_bundles WHERE device_id = ?",
                )
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(anyhow::Error::from)?
                .unwrap_or(0);
                return Err(AppError::prekeys_exhausted(version));
            };

            let result = sqlx::query(
                "UPDATE e2ee_one_time_prekeys SET claimed = 1, claimed_at = ?
                 WHERE device_id = ? AND prekey_id = ? AND claimed = 0",
            )
            .bind(Utc::now())
            .bind(device_id)
            .bind(prekey_id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;

            if result.rows_affected() == 1 {
                return Ok(ClaimedPrekey { prekey_id, prekey_pub });
            }
            // Lost the race to another claimer; retry against the next candidate.
        }
    }

    pub async fn revoke_device(&self, device_id: &str, owner_id: i64, reason: &str) -> AppResult<()> {
        let (owner, _) = self
            .device_owner(device_id)
            .await?
            .ok_or_else(|| AppError::NotFound("device not found".into()))?;
        if owner != owner_id {
            return Err(AppError::authz("only the owning user may revoke a device"));
        }

        sqlx::query("UPDATE e2ee_devices SET status = 'revoked' WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        sqlx::query("INSERT INTO e2ee_device_revocations (device_id, reason) VALUES (?, ?)")
            .bind(device_id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub async fn list_devices(&self, user_id: i64) -> AppResult<Vec<DeviceView>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            device_id: String,
            device_name: Option<String>,
            status: String,
            created_at: DateTime<Utc>,
            last_seen_at: Option<DateTime<Utc>>,
        }
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT device_id, device_name, status, created_at, last_seen_at FROM e2ee_devices WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(rows
            .into_iter()
            .map(|r| DeviceView {
                device_id: r.device_id,
                device_name: r.device_name,
                status: DeviceStatus::from_str(&r.status),
                created_at: r.created_at,
                last_seen_at: r.last_seen_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::ensure_schema(&pool).await.unwrap();
        pool
    }

    fn registry(pool: SqlitePool) -> E2EEKeyRegistry {
        E2EEKeyRegistry::new(pool, E2EEConfig::from_env())
    }

    #[tokio::test]
    async fn prekey_pool_exhausts_after_all_claims() {
        let pool = test_pool().await;
        let reg = registry(pool);
        reg.upload_bundle(
            "dev-1",
            1,
            None,
            "identity-a",
            "spk-pub",
            "spk-sig",
            &[(1, "p1".into()), (2, "p2".into())],
        )
        .await
        .unwrap();

        let c1 = reg.claim_prekey("dev-1").await.unwrap();
        let c2 = reg.claim_prekey("dev-1").await.unwrap();
        assert_ne!(c1.prekey_id, c2.prekey_id);

        let err = reg.claim_prekey("dev-1").await.unwrap_err();
        match err {
            AppError::Conflict { code, .. } => assert_eq!(code, "PREKEYS_EXHAUSTED"),
            _ => panic!("expected PREKEYS_EXHAUSTED"),
        }
    }

    #[tokio::test]
    async fn identity_change_blocks_after_threshold() {
        let pool = test_pool().await;
        let mut config = E2EEConfig::from_env();
        config.identity_change_alert_threshold = 2;
        config.identity_change_block_threshold = 3;
        let reg = E2EEKeyRegistry::new(pool, config);

        reg.upload_bundle("dev-1", 1, None, "identity-a", "spk", "sig", &[(1, "p1".into())]).await.unwrap();
        reg.upload_bundle("dev-1", 1, None, "identity-b", "spk", "sig", &[(1, "p1".into())]).await.unwrap();
        reg.upload_bundle("dev-1", 1, None, "identity-c", "spk", "sig", &[(1, "p1".into())]).await.unwrap();

        let err = reg
            .upload_bundle("dev-1", 1, None, "identity-d", "spk", "sig", &[(1, "p1".into())])
            .await
            .unwrap_err();
        match err {
            AppError::Conflict { code, .. } => assert_eq!(code, "IDENTITY_CHANGE_BLOCKED"),
            _ => panic!("expected IDENTITY_CHANGE_BLOCKED"),
        }

        let err = reg.claim_prekey("dev-1").await.unwrap_err();
        match err {
            AppError::Conflict { code, .. } => assert_eq!(code, "DEVICE_REVOKED"),
            _ => panic!("device should already be revoked"),
        }
    }
}
