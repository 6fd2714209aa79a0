// src/events/mod.rs (C2 EventBus)
//
// Thin pub/sub + work-queue wrapper over Redis. Publish retries twice with a
// short backoff and then gives up silently (the caller's write already
// committed; a dropped notification is recoverable, a failed request is
// not). Subscriptions are long-lived async streams that reconnect with
// exponential backoff on any drop, mirroring the corpus's `subscribe()`
// generator.

pub mod keys;
pub mod types;

use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

pub use types::ChatEvent;

const PUBLISH_ATTEMPTS: u32 = 2;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct EventBus {
    manager: Option<ConnectionManager>,
    client: Option<redis::Client>,
}

impl EventBus {
    pub fn new(manager: Option<ConnectionManager>, client: Option<redis::Client>) -> Self {
        Self { manager, client }
    }

    pub fn disabled() -> Self {
        Self { manager: None, client: None }
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_some()
    }

    /// Publishes to a pub/sub channel (`dm:user:*`, `group:*`). Best-effort:
    /// retries `PUBLISH_ATTEMPTS` times, then returns `Ok(())` anyway so a
    /// relay hiccup never fails the caller's write.
    pub async fn publish(&self, channel: &str, event: &ChatEvent) -> anyhow::Result<()> {
        let Some(manager) = self.manager.clone() else {
            return Ok(());
        };
        let payload = serde_json::to_string(event)?;

        let mut conn = manager;
        for attempt in 0..PUBLISH_ATTEMPTS {
            match redis::cmd("PUBLISH").arg(channel).arg(&payload).query_async::<_, i64>(&mut conn).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(channel, attempt, error = %err, "event publish attempt failed");
                    if attempt + 1 < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
                    }
                }
            }
        }
        warn!(channel, "event publish exhausted retries, dropping");
        Ok(())
    }

    /// Pushes a durable job onto `chat:event_queue` for the background
    /// worker (push fan-out, persisted notification rows). Returns `false`
    /// if Redis is unavailable so the caller can decide whether to fall
    /// back to inline processing.
    pub async fn enqueue(&self, event_type: &str, payload: serde_json::Value) -> bool {
        let Some(mut conn) = self.manager.clone() else {
            return false;
        };
        let entry = types::QueuedEvent { event_type: event_type.to_string(), payload };
        let Ok(encoded) = serde_json::to_string(&entry) else {
            return false;
        };

        match redis::cmd("RPUSH").arg(keys::EVENT_QUEUE_KEY).arg(&encoded).query_async::<_, i64>(&mut conn).await {
            Ok(_) => true,
            Err(err) => {
                warn!(event_type, error = %err, "failed to enqueue background event");
                false
            }
        }
    }

    /// Subscribes to a single channel, returning a stream of decoded
    /// `ChatEvent`s. Reconnects with exponential backoff on any Redis error;
    /// the stream only ends when the receiver is dropped.
    pub fn subscribe(&self, channel: String) -> ReceiverStream<ChatEvent> {
        let (tx, rx) = mpsc::channel(64);
        let Some(client) = self.client.clone() else {
            return ReceiverStream::new(rx);
        };

        tokio::spawn(async move {
            let mut backoff = RECONNECT_BASE_DELAY;
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(err) = pubsub.subscribe(&channel).await {
                            warn!(channel = %channel, error = %err, "pubsub subscribe failed");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
                            continue;
                        }
                        debug!(channel = %channel, "subscribed to pubsub channel");
                        backoff = RECONNECT_BASE_DELAY;

                        let mut stream = pubsub.on_message();
                        loop {
                            match stream.next().await {
                                Some(msg) => {
                                    let payload: String = match msg.get_payload() {
                                        Ok(p) => p,
                                        Err(err) => {
                                            warn!(error = %err, "pubsub payload decode failed");
                                            continue;
                                        }
                                    };
                                    match serde_json::from_str::<ChatEvent>(&payload) {
                                        Ok(event) => {
                                            if tx.send(event).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(err) => warn!(error = %err, "failed to parse chat event"),
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "pubsub connection failed");
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX_DELAY);
            }
        });

        ReceiverStream::new(rx)
    }

    /// `chat:typing:{channel}:{user_id}` dedup flag — `true` means the
    /// caller should emit a typing event (key was absent and is now set).
    pub async fn should_emit_typing(&self, channel_key: &str, user_id: i64, dedup_ms: u64) -> bool {
        let Some(mut conn) = self.manager.clone() else {
            return true;
        };
        let key = keys::typing_dedup_key(channel_key, user_id);
        match redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("PX")
            .arg(dedup_ms)
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await
        {
            Ok(set) => set.is_some(),
            Err(err) => {
                warn!(error = %err, "typing dedup check failed, defaulting to emit");
                true
            }
        }
    }

    pub async fn clear_typing(&self, channel_key: &str, user_id: i64) {
        let Some(mut conn) = self.manager.clone() else {
            return;
        };
        let key = keys::typing_dedup_key(channel_key, user_id);
        let _: Result<(), _> = redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
    }
}
