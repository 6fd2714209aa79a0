// src/config/e2ee.rs
// E2EE DM layer configuration: device/prekey pool, identity-change policy,
// per-sender rate limits, and the SSE connection cap.

use serde::{Deserialize, Serialize};

use super::helpers::env_parsed_or;
use super::surfaces::SurfaceRateLimit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct E2EEConfig {
    pub enabled: bool,
    pub max_message_size_bytes: usize,
    pub prekey_pool_size: usize,
    pub identity_change_alert_threshold: u32,
    pub identity_change_block_threshold: u32,
    pub max_concurrent_streams_per_user: usize,
    pub sse_allow_query_token: bool,
    pub rate_limit: SurfaceRateLimit,
}

impl E2EEConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_parsed_or("E2EE_ENABLED", true),
            max_message_size_bytes: env_parsed_or("E2EE_MAX_MESSAGE_SIZE", 64 * 1024),
            prekey_pool_size: env_parsed_or("E2EE_PREKEY_POOL_SIZE", 100),
            identity_change_alert_threshold: env_parsed_or(
                "E2EE_IDENTITY_CHANGE_ALERT_THRESHOLD",
                2,
            ),
            identity_change_block_threshold: env_parsed_or(
                "E2EE_IDENTITY_CHANGE_BLOCK_THRESHOLD",
                3,
            ),
            max_concurrent_streams_per_user: env_parsed_or(
                "E2EE_MAX_CONCURRENT_STREAMS_PER_USER",
                4,
            ),
            sse_allow_query_token: env_parsed_or("E2EE_SSE_ALLOW_QUERY_TOKEN", false),
            rate_limit: SurfaceRateLimit::from_env("E2EE_DM", 60, 10, 5),
        }
    }
}
