// src/sse/mod.rs (C12 SSEHub)
//
// Per-user SSE fan-out. One stream multiplexes the caller's personal DM
// channel and every group channel they currently belong to, heartbeats on
// a fixed interval, enforces token expiry mid-stream, and caps concurrent
// streams per user with a process-local guard (the corpus has no
// multi-process deployment story here, so a `parking_lot::Mutex`-guarded
// map is the whole mechanism — see `watcher/` for the same "local process
// owns this resource" shape applied to file descriptors instead of
// sockets). Grounded on `mira-chat/src/server.rs`'s `chat_stream_handler`
// for the channel-to-`Sse<impl Stream>` conversion via `async_stream`.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::SessionClaims;
use crate::config::sse::SseConfig;
use crate::error::{AppError, AppResult};
use crate::events::{keys, ChatEvent, EventBus};
use crate::presence::PresenceTracker;

/// Tracks how many live streams each user currently holds, so a runaway
/// client (or a bug that never closes a stream) can't exhaust connections
/// for everyone else. Decremented by `ConnectionGuard::drop`.
#[derive(Default)]
struct ConnectionCounter(Mutex<HashMap<i64, usize>>);

impl ConnectionCounter {
    fn try_acquire(&self, user_id: i64, max_per_user: usize) -> Option<ConnectionGuard> {
        let mut map = self.0.lock();
        let count = map.entry(user_id).or_insert(0);
        if *count >= max_per_user {
            return None;
        }
        *count += 1;
        Some(ConnectionGuard { counter: None, user_id })
    }
}

/// RAII guard decrementing the per-user stream count on drop. Holds no
/// reference to the counter directly (it is process-global inside the hub)
/// — the hub's `Arc` clone keeps it alive for the stream's lifetime.
struct ConnectionGuard {
    counter: Option<Arc<ConnectionCounter>>,
    user_id: i64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(counter) = self.counter.take() {
            let mut map = counter.0.lock();
            if let Some(count) = map.get_mut(&self.user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    map.remove(&self.user_id);
                }
            }
        }
    }
}

pub struct SSEHub {
    pool: SqlitePool,
    events: Arc<EventBus>,
    presence: Arc<PresenceTracker>,
    config: SseConfig,
    max_streams_per_user: usize,
    connections: Arc<ConnectionCounter>,
}

impl SSEHub {
    pub fn new(pool: SqlitePool, events: Arc<EventBus>, presence: Arc<PresenceTracker>, config: SseConfig, max_streams_per_user: usize) -> Self {
        Self {
            pool,
            events,
            presence,
            config,
            max_streams_per_user,
            connections: Arc::new(ConnectionCounter::default()),
        }
    }

    async fn active_group_ids(&self, user_id: i64) -> AppResult<HashSet<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT group_id FROM group_participants WHERE user_id = ? AND is_banned = 0",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        Ok(ids.into_iter().filter_map(|id| Uuid::parse_str(&id).ok()).collect())
    }

    /// Opens a new multiplexed stream for `user_id`, subscribing to their
    /// personal DM channel plus every group channel they currently belong
    /// to. Returns `AppError::TooManyStreams` (429) at the per-user
    /// connection cap.
    pub async fn stream(&self, user_id: i64, claims: SessionClaims) -> AppResult<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>> {
        let mut guard = self
            .connections
            .try_acquire(user_id, self.max_streams_per_user)
            .ok_or_else(AppError::too_many_streams)?;
        guard.counter = Some(self.connections.clone());

        crate::metrics::sse_stream_opened();
        self.presence.on_connect(user_id, Utc::now()).await.map_err(AppError::Internal)?;

        let (tx, rx) = mpsc::channel::<ChatEvent>(128);
        let mut subscribed: HashSet<String> = HashSet::new();

        let dm_channel = keys::dm_channel(user_id);
        self.spawn_forward(dm_channel.clone(), tx.clone());
        subscribed.insert(dm_channel);

        for group_id in self.active_group_ids(user_id).await? {
            let channel = keys::group_channel(group_id);
            self.spawn_forward(channel.clone(), tx.clone());
            subscribed.insert(channel);
        }

        let pool = self.pool.clone();
        let events = self.events.clone();
        let presence = self.presence.clone();
        let heartbeat_period = std::time::Duration::from_secs(self.config.heartbeat_seconds.max(1));
        let presence_period = std::time::Duration::from_secs(self.config.presence_update_interval_seconds.max(1));
        let rehydrate_period = std::time::Duration::from_secs(self.config.redis_retry_interval_seconds.max(1));
        let max_missed = self.config.max_missed_heartbeats;

        let stream = async_stream::stream! {
            let _guard = guard;
            let mut rx = rx;
            let mut heartbeat_timer = tokio::time::interval(heartbeat_period);
            let mut presence_timer = tokio::time::interval(presence_period);
            let mut rehydrate_timer = tokio::time::interval(rehydrate_period);
            let mut missed = 0u32;

            yield Ok(Event::default().retry(std::time::Duration::from_millis(5000)));

            loop {
                tokio::select! {
                    biased;

                    _ = heartbeat_timer.tick() => {
                        if claims.is_expired(Utc::now()) {
                            let payload = serde_json::to_string(&ChatEvent::AuthExpired {
                                message: "session token expired".to_string(),
                            }).unwrap_or_default();
                            yield Ok(Event::default().data(payload));
                            break;
                        }

                        let relay_lag = !events.is_connected();
                        missed = if relay_lag { missed + 1 } else { 0 };
                        crate::metrics::record_sse_heartbeat(relay_lag);

                        let redis_status = if relay_lag { "down" } else { "up" };
                        let payload = serde_json::to_string(&ChatEvent::Heartbeat { relay_lag, redis_status }).unwrap_or_default();
                        yield Ok(Event::default().data(payload));

                        if missed > max_missed {
                            warn!(user_id, missed, "sse stream exceeded missed-heartbeat budget, closing");
                            break;
                        }
                    }

                    _ = presence_timer.tick() => {
                        if let Err(err) = presence.on_heartbeat(user_id, Utc::now()).await {
                            warn!(error = %err, "sse presence heartbeat failed");
                        }
                    }

                    _ = rehydrate_timer.tick() => {
                        match sqlx::query_scalar::<_, String>(
                            "SELECT group_id FROM group_participants WHERE user_id = ? AND is_banned = 0",
                        )
                        .bind(user_id)
                        .fetch_all(&pool)
                        .await
                        {
                            Ok(ids) => {
                                for raw in ids {
                                    let Ok(group_id) = Uuid::parse_str(&raw) else { continue };
                                    let channel = keys::group_channel(group_id);
                                    if subscribed.insert(channel.clone()) {
                                        debug!(user_id, channel = %channel, "sse stream subscribing to newly joined group");
                                        let rx = events.subscribe(channel);
                                        let forward_tx = tx.clone();
                                        tokio::spawn(async move {
                                            let mut rx = rx;
                                            while let Some(event) = rx.next().await {
                                                if forward_tx.send(event).await.is_err() {
                                                    break;
                                                }
                                            }
                                        });
                                    }
                                }
                            }
                            Err(err) => warn!(error = %err, "failed to refresh group membership for sse rehydration"),
                        }
                    }

                    maybe_event = rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                let payload = serde_json::to_string(&event).unwrap_or_default();
                                yield Ok(Event::default().data(payload));
                            }
                            None => break,
                        }
                    }
                }
            }

            presence.on_disconnect(user_id).await.ok();
            crate::metrics::sse_stream_closed();
        };

        Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
    }

    fn spawn_forward(&self, channel: String, tx: mpsc::Sender<ChatEvent>) {
        let mut rx: ReceiverStream<ChatEvent> = self.events.subscribe(channel);
        tokio::spawn(async move {
            while let Some(event) = rx.next().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
}
