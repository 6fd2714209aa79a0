// src/config/mod.rs
// Central configuration for the pulsechat backend.

pub mod e2ee;
pub mod groups;
pub mod helpers;
pub mod notifications;
pub mod server;
pub mod sse;
pub mod surfaces;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use helpers::env_parsed_or;

lazy_static! {
    pub static ref CONFIG: PulseConfig = PulseConfig::from_env();
}

/// Top-level configuration, composed from one sub-config per concern.
/// Mirrors the teacher's domain-config composition: each section owns its
/// own `from_env()` and the aggregate just wires them together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseConfig {
    pub server: server::ServerConfig,
    pub database: server::DatabaseConfig,
    pub redis: server::RedisConfig,
    pub logging: server::LoggingConfig,
    pub global_chat: surfaces::GlobalChatConfig,
    pub trivia: surfaces::TriviaChatConfig,
    pub private_chat: surfaces::PrivateChatConfig,
    pub e2ee: e2ee::E2EEConfig,
    pub groups: groups::GroupsConfig,
    pub notifications: notifications::NotificationsConfig,
    pub sse: sse::SseConfig,
    pub presence_enabled: bool,
    pub status_enabled: bool,
}

impl PulseConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            server: server::ServerConfig::from_env(),
            database: server::DatabaseConfig::from_env(),
            redis: server::RedisConfig::from_env(),
            logging: server::LoggingConfig::from_env(),
            global_chat: surfaces::GlobalChatConfig::from_env(),
            trivia: surfaces::TriviaChatConfig::from_env(),
            private_chat: surfaces::PrivateChatConfig::from_env(),
            e2ee: e2ee::E2EEConfig::from_env(),
            groups: groups::GroupsConfig::from_env(),
            notifications: notifications::NotificationsConfig::from_env(),
            sse: sse::SseConfig::from_env(),
            presence_enabled: env_parsed_or("PRESENCE_ENABLED", true),
            status_enabled: env_parsed_or("STATUS_ENABLED", false),
        }
    }

    pub fn bind_address(&self) -> String {
        self.server.bind_address()
    }
}
