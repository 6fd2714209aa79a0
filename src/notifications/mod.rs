// src/notifications/mod.rs (C3 NotificationDispatcher)
//
// Chooses in-app vs system push per recipient from live-activity signals,
// batches device lists, and persists a notification record per recipient.
// Delivery is best-effort: push failures are logged and never propagate to
// the ingest caller (§7 Upstream). Grounded on the corpus's worker-pool
// pattern for offloading I/O-bound fan-out (`build/tracker.rs` spawns
// background work the same way); here the "worker" is the caller's own
// `tokio::spawn`'d task so ingest commits before dispatch runs.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::notifications::NotificationsConfig;
use crate::mute::{ChatSurface, MuteStore};
use crate::push::{DevicePlatform, PushBatchResult, PushPayload, PushProvider, PushTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSurface {
    Global,
    Trivia,
    Private,
    Dm,
    Group,
}

pub struct DispatchRequest {
    pub surface: NotificationSurface,
    pub sender_id: i64,
    pub recipients: Vec<i64>,
    pub heading: String,
    pub body: String,
    pub data: serde_json::Value,
}

pub struct NotificationDispatcher {
    pool: SqlitePool,
    mute_store: Arc<MuteStore>,
    push: Arc<dyn PushProvider>,
    config: NotificationsConfig,
}

impl NotificationDispatcher {
    pub fn new(pool: SqlitePool, mute_store: Arc<MuteStore>, push: Arc<dyn PushProvider>, config: NotificationsConfig) -> Self {
        Self { pool, mute_store, push, config }
    }

    /// Runs the full pipeline: mute filter -> activity split -> batch ->
    /// send -> persist. Intended to be spawned off the ingest path so it
    /// never blocks the request that triggered it.
    pub async fn dispatch(&self, request: DispatchRequest) {
        let recipients: Vec<i64> = request
            .recipients
            .into_iter()
            .filter(|id| *id != request.sender_id)
            .collect();
        if recipients.is_empty() {
            return;
        }

        let muted = match self.muted_recipients(&request.surface, &recipients, request.sender_id).await {
            Ok(muted) => muted,
            Err(err) => {
                tracing::warn!(error = %err, "mute lookup failed, notifying all candidates");
                HashSet::new()
            }
        };

        let active_recipients: Vec<i64> = recipients.into_iter().filter(|id| !muted.contains(id)).collect();
        if active_recipients.is_empty() {
            return;
        }

        let body_preview: String = request.body.chars().take(self.config.body_preview_chars).collect();

        let devices = match crate::push::PushDeviceRepo::new(self.pool.clone())
            .devices_for_users(&active_recipients)
            .await
        {
            Ok(devices) => devices,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load push devices for dispatch");
                Vec::new()
            }
        };

        let threshold = chrono::Duration::seconds(self.config.activity_threshold_seconds);
        let now = Utc::now();

        let (in_app, system): (Vec<_>, Vec<_>) = devices.into_iter().partition(|d| now - d.last_active < threshold);
        let in_app_recipients: HashSet<i64> = in_app.iter().map(|d| d.user_id).collect();

        for (targets, show_as_in_app) in [(in_app, true), (system, false)] {
            if targets.is_empty() {
                continue;
            }
            let push_targets: Vec<PushTarget> = targets
                .iter()
                .filter_map(|d| {
                    let platform = match d.platform.as_str() {
                        "ios" => DevicePlatform::Ios,
                        "android" => DevicePlatform::Android,
                        _ => DevicePlatform::Web,
                    };
                    Some(PushTarget { user_id: d.user_id, player_id: d.player_id.clone(), platform })
                })
                .collect();

            for chunk in push_targets.chunks(self.config.push_batch_size) {
                let payload = PushPayload {
                    heading: request.heading.clone(),
                    body: body_preview.clone(),
                    show_as_in_app,
                    data: request.data.clone(),
                };
                match self.push.send_batch(chunk, &payload).await {
                    Ok(PushBatchResult { invalid_player_ids }) => {
                        let repo = crate::push::PushDeviceRepo::new(self.pool.clone());
                        for player_id in invalid_player_ids {
                            if let Err(err) = repo.mark_invalid(&player_id).await {
                                tracing::warn!(error = %err, "failed to mark push device invalid");
                            }
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "push batch send failed"),
                }
            }
        }

        for recipient_id in &active_recipients {
            let is_in_app = in_app_recipients.contains(recipient_id);
            if let Err(err) = self
                .persist_record(*recipient_id, &request.surface, &request.heading, &body_preview, is_in_app)
                .await
            {
                tracing::warn!(error = %err, "failed to persist notification record");
            }
        }

        tracing::debug!(
            surface = ?request.surface,
            recipient_count = active_recipients.len(),
            "notification dispatch complete"
        );
    }

    async fn muted_recipients(&self, surface: &NotificationSurface, recipients: &[i64], sender_id: i64) -> anyhow::Result<HashSet<i64>> {
        match surface {
            NotificationSurface::Global => self.mute_store.get_muted_user_ids(recipients, ChatSurface::Global).await,
            NotificationSurface::Trivia => self.mute_store.get_muted_user_ids(recipients, ChatSurface::Trivia).await,
            NotificationSurface::Private | NotificationSurface::Dm => {
                let mut muted = HashSet::new();
                for recipient_id in recipients {
                    if self.mute_store.is_muted_for_private_chat(sender_id, *recipient_id).await? {
                        muted.insert(*recipient_id);
                    }
                }
                Ok(muted)
            }
            NotificationSurface::Group => Ok(HashSet::new()),
        }
    }

    async fn persist_record(&self, recipient_id: i64, surface: &NotificationSurface, heading: &str, body: &str, is_in_app: bool) -> anyhow::Result<()> {
        let surface_str = match surface {
            NotificationSurface::Global => "global",
            NotificationSurface::Trivia => "trivia",
            NotificationSurface::Private => "private",
            NotificationSurface::Dm => "dm",
            NotificationSurface::Group => "group",
        };
        sqlx::query(
            "INSERT INTO notification_records (recipient_id, surface, heading, body, is_in_app) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(recipient_id)
        .bind(surface_str)
        .bind(heading)
        .bind(body)
        .bind(is_in_app)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    struct FakePush {
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl PushProvider for FakePush {
        async fn send_batch(&self, targets: &[PushTarget], _payload: &PushPayload) -> anyhow::Result<PushBatchResult> {
            self.calls.lock().unwrap().push(targets.len());
            Ok(PushBatchResult { invalid_player_ids: Vec::new() })
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::ensure_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn muted_recipient_never_receives_a_push() {
        let pool = test_pool().await;
        let mute_store = Arc::new(MuteStore::new(pool.clone()));
        mute_store.get_or_create(2, true).await.unwrap();
        sqlx::query("UPDATE chat_mute_preferences SET global_chat_muted = 1 WHERE user_id = 2")
            .execute(&pool)
            .await
            .unwrap();

        crate::push::PushDeviceRepo::new(pool.clone())
            .register(2, "player-2", DevicePlatform::Ios, 10)
            .await
            .unwrap();

        let push = Arc::new(FakePush { calls: Mutex::new(Vec::new()) });
        let dispatcher = NotificationDispatcher::new(pool, mute_store, push.clone(), NotificationsConfig::from_env());

        dispatcher
            .dispatch(DispatchRequest {
                surface: NotificationSurface::Global,
                sender_id: 1,
                recipients: vec![2],
                heading: "New message".into(),
                body: "hi".into(),
                data: serde_json::json!({}),
            })
            .await;

        assert!(push.calls.lock().unwrap().is_empty());
    }
}
