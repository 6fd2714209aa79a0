// src/config/notifications.rs
// NotificationDispatcher (C3) and push-device tuning.

use serde::{Deserialize, Serialize};

use super::helpers::env_parsed_or;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Recipients whose `last_active` is within this many seconds of now get
    /// an in-app notification; everyone else gets a system push.
    pub activity_threshold_seconds: i64,
    /// Cap on push devices batched into a single outbound push request.
    pub push_batch_size: usize,
    /// Cap on push devices registered per user (ONS_Max_Players_Per_User).
    pub max_devices_per_user: usize,
    /// Preview body truncation length.
    pub body_preview_chars: usize,
}

impl NotificationsConfig {
    pub fn from_env() -> Self {
        Self {
            activity_threshold_seconds: env_parsed_or(
                "ONESIGNAL_ACTIVITY_THRESHOLD_SECONDS",
                30,
            ),
            push_batch_size: env_parsed_or("PULSECHAT_PUSH_BATCH_SIZE", 2_000),
            max_devices_per_user: env_parsed_or("ONS_MAX_PLAYERS_PER_USER", 10),
            body_preview_chars: env_parsed_or("PULSECHAT_NOTIFICATION_PREVIEW_CHARS", 100),
        }
    }
}
