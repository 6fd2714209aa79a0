// src/push.rs
// Narrow interface to the external push provider (OneSignal-shaped). The
// HTTP client details (endpoint, auth) live behind this trait so
// `NotificationDispatcher` can be tested with a fake and so swapping
// providers never touches the dispatch logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    Ios,
    Android,
    Web,
}

#[derive(Debug, Clone)]
pub struct PushTarget {
    pub user_id: i64,
    pub player_id: String,
    pub platform: DevicePlatform,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub heading: String,
    pub body: String,
    pub show_as_in_app: bool,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct PushBatchResult {
    /// player ids the provider reported as invalid/unregistered.
    pub invalid_player_ids: Vec<String>,
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn send_batch(&self, targets: &[PushTarget], payload: &PushPayload) -> anyhow::Result<PushBatchResult>;
}

/// `reqwest`-backed OneSignal client. A 10s timeout per the concurrency
/// model's outcall budget; failures are logged and never propagate to the
/// ingest caller (§7 Upstream failure kind).
pub struct OneSignalClient {
    http: reqwest::Client,
    app_id: String,
    api_key: String,
}

impl OneSignalClient {
    pub fn new(app_id: String, api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build push HTTP client");
        Self { http, app_id, api_key }
    }
}

#[async_trait]
impl PushProvider for OneSignalClient {
    async fn send_batch(&self, targets: &[PushTarget], payload: &PushPayload) -> anyhow::Result<PushBatchResult> {
        if targets.is_empty() {
            return Ok(PushBatchResult { invalid_player_ids: Vec::new() });
        }

        let player_ids: Vec<&str> = targets.iter().map(|t| t.player_id.as_str()).collect();
        let body = serde_json::json!({
            "app_id": self.app_id,
            "include_player_ids": player_ids,
            "headings": {"en": payload.heading},
            "contents": {"en": payload.body},
            "data": payload.data,
        });

        let response = self
            .http
            .post("https://onesignal.com/api/v1/notifications")
            .header("Authorization", format!("Basic {}", self.api_key))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let invalid = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("errors").cloned())
                    .and_then(|errors| errors.get("invalid_player_ids").cloned())
                    .and_then(|ids| ids.as_array().cloned())
                    .map(|ids| ids.into_iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                Ok(PushBatchResult { invalid_player_ids: invalid })
            }
            Err(err) => {
                tracing::warn!(error = %err, "push batch send failed");
                Ok(PushBatchResult { invalid_player_ids: Vec::new() })
            }
        }
    }
}

/// `PushDevice` repository (OneSignal device registrations).
pub struct PushDeviceRepo {
    pool: sqlx::SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PushDeviceRow {
    pub user_id: i64,
    pub player_id: String,
    pub platform: String,
    pub is_valid: bool,
    pub last_active: chrono::DateTime<chrono::Utc>,
}

impl PushDeviceRepo {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers a device, evicting the oldest once the per-user cap is
    /// exceeded (`ONS_Max_Players_Per_User`).
    pub async fn register(&self, user_id: i64, player_id: &str, platform: DevicePlatform, cap: usize) -> anyhow::Result<()> {
        let platform_str = match platform {
            DevicePlatform::Ios => "ios",
            DevicePlatform::Android => "android",
            DevicePlatform::Web => "web",
        };

        sqlx::query(
            "INSERT INTO push_devices (user_id, player_id, platform, is_valid, last_active)
             VALUES (?, ?, ?, 1, datetime('now'))
             ON CONFLICT(user_id, player_id) DO UPDATE SET
               is_valid = 1, last_active = datetime('now'), platform = excluded.platform",
        )
        .bind(user_id)
        .bind(player_id)
        .bind(platform_str)
        .execute(&self.pool)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM push_devices WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        if count as usize > cap {
            sqlx::query(
                "DELETE FROM push_devices WHERE rowid IN (
                    SELECT rowid FROM push_devices WHERE user_id = ?
                    ORDER BY last_active ASC LIMIT ?
                )",
            )
            .bind(user_id)
            .bind(count as usize - cap)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn devices_for_users(&self, user_ids: &[i64]) -> anyhow::Result<Vec<PushDeviceRow>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = user_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT user_id, player_id, platform, is_valid, last_active FROM push_devices
             WHERE is_valid = 1 AND user_id IN ({placeholders})"
        );
        let mut query = sqlx::query_as::<_, PushDeviceRow>(&sql);
        for id in user_ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    pub async fn mark_invalid(&self, player_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE push_devices SET is_valid = 0, last_failure_at = datetime('now') WHERE player_id = ?")
            .bind(player_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Periodic cleanup (supplemented feature): drops devices that have
    /// been marked invalid for longer than `older_than_days`, keeping the
    /// table the dispatcher scans small.
    pub async fn prune_invalid(&self, older_than_days: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM push_devices
             WHERE is_valid = 0 AND last_failure_at IS NOT NULL
               AND last_failure_at < datetime('now', ? || ' days')",
        )
        .bind(-older_than_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
