// src/config/sse.rs
// SSEHub (C12) timing knobs.

use serde::{Deserialize, Serialize};

use super::helpers::env_parsed_or;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    pub heartbeat_seconds: u64,
    pub max_missed_heartbeats: u32,
    pub redis_retry_interval_seconds: u64,
    pub presence_update_interval_seconds: u64,
}

impl SseConfig {
    pub fn from_env() -> Self {
        Self {
            heartbeat_seconds: env_parsed_or("SSE_HEARTBEAT_SECONDS", 15),
            max_missed_heartbeats: env_parsed_or("SSE_MAX_MISSED_HEARTBEATS", 3),
            redis_retry_interval_seconds: env_parsed_or("REDIS_RETRY_INTERVAL_SECONDS", 30),
            presence_update_interval_seconds: env_parsed_or(
                "PRESENCE_UPDATE_INTERVAL_SECONDS",
                60,
            ),
        }
    }
}
