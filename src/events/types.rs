// src/events/types.rs
// Wire-level event envelope shared by the Redis pub/sub transport and the
// SSE hub. Message bodies are carried as opaque JSON — the owning surface
// (dm, groups, chat) serializes its own DTO into the payload so this module
// has no dependency on their types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Heartbeat {
        relay_lag: bool,
        redis_status: &'static str,
    },
    AuthExpired {
        message: String,
    },
    Dm {
        message: serde_json::Value,
    },
    GroupMessage {
        group_id: Uuid,
        message: serde_json::Value,
    },
    EpochChanged {
        group_id: Uuid,
        new_epoch: i64,
        reason: String,
    },
    StatusPost {
        post: serde_json::Value,
    },
    GlobalMessage {
        message: serde_json::Value,
    },
    TriviaMessage {
        message: serde_json::Value,
    },
    PrivateMessage {
        conversation_id: i64,
        message: serde_json::Value,
    },
    Typing {
        channel: String,
        user_id: i64,
    },
}

/// Entries placed on the `chat:event_queue` list for the background worker
/// (push fan-out, persisted-notification writes) rather than relayed
/// directly to an SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}
