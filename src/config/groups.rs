// src/config/groups.rs
// Group messaging configuration.

use serde::{Deserialize, Serialize};

use super::helpers::env_parsed_or;
use super::surfaces::SurfaceRateLimit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    pub enabled: bool,
    pub max_participants: u32,
    pub invite_expiry_hours: i64,
    pub rate_limit: SurfaceRateLimit,
}

impl GroupsConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_parsed_or("GROUPS_ENABLED", true),
            max_participants: env_parsed_or("GROUP_MAX_PARTICIPANTS", 256),
            invite_expiry_hours: env_parsed_or("GROUP_INVITE_EXPIRY_HOURS", 72),
            rate_limit: SurfaceRateLimit::from_env("GROUP_MESSAGE", 60, 8, 5),
        }
    }
}
