// src/events/keys.rs
// Centralizes the Redis key/channel namespace so every caller agrees on the
// same strings. Grounded on the corpus's flat `chat:*` prefix convention.

pub const EVENT_QUEUE_KEY: &str = "chat:event_queue";

pub fn dm_channel(user_id: i64) -> String {
    format!("dm:user:{user_id}")
}

pub fn group_channel(group_id: uuid::Uuid) -> String {
    format!("group:{group_id}")
}

pub const TRIVIA_LIKES_CHANNEL: &str = "chat:trivia:likes";

pub fn typing_dedup_key(channel_key: &str, user_id: i64) -> String {
    format!("chat:typing:{channel_key}:{user_id}")
}

pub fn rate_limit_key(namespace: &str, identifier: impl std::fmt::Display) -> String {
    format!("chat:rl:{namespace}:{identifier}")
}

pub fn burst_rate_limit_key(namespace: &str, identifier: impl std::fmt::Display) -> String {
    format!("chat:rl:{namespace}:burst:{identifier}")
}
