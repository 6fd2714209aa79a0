// src/config/surfaces.rs
// Feature gates and per-surface rate-limit / length knobs for the plaintext
// chat surfaces (global, trivia-live, private).

use serde::{Deserialize, Serialize};

use super::helpers::env_parsed_or;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceRateLimit {
    pub max_messages_per_minute: u32,
    pub max_messages_per_burst: u32,
    pub burst_window_seconds: u64,
}

impl SurfaceRateLimit {
    fn from_env(prefix: &str, per_minute: u32, per_burst: u32, burst_window: u64) -> Self {
        Self {
            max_messages_per_minute: env_parsed_or(
                &format!("{prefix}_MAX_MESSAGES_PER_MINUTE"),
                per_minute,
            ),
            max_messages_per_burst: env_parsed_or(
                &format!("{prefix}_MAX_MESSAGES_PER_BURST"),
                per_burst,
            ),
            burst_window_seconds: env_parsed_or(
                &format!("{prefix}_BURST_WINDOW_SECONDS"),
                burst_window,
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalChatConfig {
    pub enabled: bool,
    pub max_message_length: usize,
    pub retention_days: u32,
    pub rate_limit: SurfaceRateLimit,
}

impl GlobalChatConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_parsed_or("GLOBAL_CHAT_ENABLED", true),
            max_message_length: env_parsed_or("GLOBAL_CHAT_MAX_MESSAGE_LENGTH", 2_000),
            retention_days: env_parsed_or("GLOBAL_CHAT_RETENTION_DAYS", 90),
            rate_limit: SurfaceRateLimit::from_env("GLOBAL_CHAT", 20, 5, 5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriviaChatConfig {
    pub enabled: bool,
    pub max_message_length: usize,
    pub pre_window_minutes: i64,
    pub post_window_minutes: i64,
    pub rate_limit: SurfaceRateLimit,
}

impl TriviaChatConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_parsed_or("TRIVIA_ENABLED", true),
            max_message_length: env_parsed_or("TRIVIA_CHAT_MAX_MESSAGE_LENGTH", 2_000),
            pre_window_minutes: env_parsed_or("TRIVIA_PRE_WINDOW_MINUTES", 15),
            post_window_minutes: env_parsed_or("TRIVIA_POST_WINDOW_MINUTES", 30),
            rate_limit: SurfaceRateLimit::from_env("TRIVIA_CHAT", 30, 8, 5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateChatConfig {
    pub enabled: bool,
    pub max_message_length: usize,
    pub admin_auto_accept: bool,
    pub rate_limit: SurfaceRateLimit,
}

impl PrivateChatConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_parsed_or("PRIVATE_ENABLED", true),
            max_message_length: env_parsed_or("PRIVATE_CHAT_MAX_MESSAGE_LENGTH", 4_000),
            admin_auto_accept: env_parsed_or("PRIVATE_CHAT_ADMIN_AUTO_ACCEPT", true),
            rate_limit: SurfaceRateLimit::from_env("PRIVATE_CHAT", 30, 5, 5),
        }
    }
}
