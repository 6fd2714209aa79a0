// src/state.rs
// Application state: constructor-injected component registry. No global
// singletons — every component takes the collaborators it needs as
// constructor arguments, so swapping `UserDirectory`/`AdminRegistry`/
// `TriviaDrawClock` at this one call site is enough to retarget the whole
// crate at a different identity/admin/trivia backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::chat::{GlobalChatService, PrivateChatService, TriviaChatService};
use crate::config::PulseConfig;
use crate::directory::{DailyDrawClock, SqliteAdminRegistry, SqliteUserDirectory};
use crate::dm::DMPipeline;
use crate::e2ee::E2EEKeyRegistry;
use crate::events::EventBus;
use crate::external::{AdminRegistry, TriviaDrawClock, UserDirectory};
use crate::groups::GroupPipeline;
use crate::mute::MuteStore;
use crate::notifications::NotificationDispatcher;
use crate::presence::PresenceTracker;
use crate::push::{OneSignalClient, PushDeviceRepo, PushProvider};
use crate::rate_limit::TieredRateLimiter;
use crate::sse::SSEHub;
use crate::status::StatusService;
use crate::webhook::WebhookLedger;

pub struct AppState {
    pub pool: SqlitePool,
    pub config: &'static PulseConfig,
    pub events: Arc<EventBus>,

    pub users: Arc<dyn UserDirectory>,
    pub admin_registry: Arc<dyn AdminRegistry>,
    pub draw_clock: Arc<dyn TriviaDrawClock>,

    pub presence: Arc<PresenceTracker>,
    pub mute_store: Arc<MuteStore>,
    pub notifications: Arc<NotificationDispatcher>,
    pub push_devices: Arc<PushDeviceRepo>,

    pub global_chat: GlobalChatService,
    pub trivia_chat: TriviaChatService,
    pub private_chat: PrivateChatService,

    pub e2ee: Arc<E2EEKeyRegistry>,
    pub dm: DMPipeline,
    pub groups: GroupPipeline,

    pub sse_hub: SSEHub,
    pub status: StatusService,
    pub webhooks: WebhookLedger,
}

async fn connect_redis(config: &crate::config::server::RedisConfig) -> Option<ConnectionManager> {
    let client = match redis::Client::open(config.url.as_str()) {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "invalid redis url, running without distributed rate-limit/event-bus backing");
            return None;
        }
    };

    match tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), ConnectionManager::new(client.clone())).await {
        Ok(Ok(manager)) => Some(manager),
        Ok(Err(err)) => {
            warn!(error = %err, "redis connection failed, falling back to in-memory rate limiting and a disabled event bus");
            None
        }
        Err(_) => {
            warn!("redis connection timed out, falling back to in-memory rate limiting and a disabled event bus");
            None
        }
    }
}

impl AppState {
    pub async fn new(config: &'static PulseConfig) -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.timeout_seconds))
            .connect(&config.database.url)
            .await
            .context("failed to connect to sqlite database")?;

        crate::db::ensure_schema(&pool).await.context("failed to bootstrap schema")?;

        let redis_manager = connect_redis(&config.redis).await;
        let redis_client = redis::Client::open(config.redis.url.as_str()).ok();
        let events = Arc::new(EventBus::new(redis_manager.clone(), redis_client));

        let users: Arc<dyn UserDirectory> = Arc::new(SqliteUserDirectory::new(pool.clone()));
        let admin_registry: Arc<dyn AdminRegistry> = Arc::new(SqliteAdminRegistry::new(pool.clone()));
        let draw_clock: Arc<dyn TriviaDrawClock> = Arc::new(DailyDrawClock::new(
            env_u32("TRIVIA_DRAW_HOUR_UTC", 18),
            env_u32("TRIVIA_DRAW_MINUTE_UTC", 0),
            config.trivia.pre_window_minutes,
            config.trivia.post_window_minutes,
        ));

        let presence = Arc::new(PresenceTracker::new(pool.clone()));
        let mute_store = Arc::new(MuteStore::new(pool.clone()));

        let push_provider: Arc<dyn PushProvider> = Arc::new(OneSignalClient::new(
            std::env::var("ONESIGNAL_APP_ID").unwrap_or_default(),
            std::env::var("ONESIGNAL_API_KEY").unwrap_or_default(),
        ));
        let push_devices = Arc::new(PushDeviceRepo::new(pool.clone()));
        let notifications = Arc::new(NotificationDispatcher::new(
            pool.clone(),
            mute_store.clone(),
            push_provider,
            config.notifications.clone(),
        ));

        let global_chat = GlobalChatService::new(
            pool.clone(),
            config.global_chat.clone(),
            TieredRateLimiter::new(
                "global",
                config.global_chat.rate_limit.max_messages_per_minute,
                config.global_chat.rate_limit.max_messages_per_burst,
                Duration::from_secs(config.global_chat.rate_limit.burst_window_seconds),
                redis_manager.clone(),
            ),
            events.clone(),
            users.clone(),
            presence.clone(),
            notifications.clone(),
        );

        let trivia_chat = TriviaChatService::new(
            pool.clone(),
            config.trivia.clone(),
            TieredRateLimiter::new(
                "trivia",
                config.trivia.rate_limit.max_messages_per_minute,
                config.trivia.rate_limit.max_messages_per_burst,
                Duration::from_secs(config.trivia.rate_limit.burst_window_seconds),
                redis_manager.clone(),
            ),
            events.clone(),
            users.clone(),
            draw_clock.clone(),
            notifications.clone(),
        );

        let private_chat = PrivateChatService::new(
            pool.clone(),
            config.private_chat.clone(),
            TieredRateLimiter::new(
                "private",
                config.private_chat.rate_limit.max_messages_per_minute,
                config.private_chat.rate_limit.max_messages_per_burst,
                Duration::from_secs(config.private_chat.rate_limit.burst_window_seconds),
                redis_manager.clone(),
            ),
            events.clone(),
            admin_registry.clone(),
            users.clone(),
            presence.clone(),
            mute_store.clone(),
            notifications.clone(),
        );

        let e2ee = Arc::new(E2EEKeyRegistry::new(pool.clone(), config.e2ee.clone()));

        let dm = DMPipeline::new(
            pool.clone(),
            config.e2ee.clone(),
            TieredRateLimiter::new(
                "dm",
                config.e2ee.rate_limit.max_messages_per_minute,
                config.e2ee.rate_limit.max_messages_per_burst,
                Duration::from_secs(config.e2ee.rate_limit.burst_window_seconds),
                redis_manager.clone(),
            ),
            events.clone(),
            e2ee.clone(),
        );

        let groups = GroupPipeline::new(
            pool.clone(),
            config.groups.clone(),
            TieredRateLimiter::new(
                "group",
                config.groups.rate_limit.max_messages_per_minute,
                config.groups.rate_limit.max_messages_per_burst,
                Duration::from_secs(config.groups.rate_limit.burst_window_seconds),
                redis_manager.clone(),
            ),
            events.clone(),
            e2ee.clone(),
        );

        let sse_hub = SSEHub::new(pool.clone(), events.clone(), presence.clone(), config.sse.clone(), config.e2ee.max_concurrent_streams_per_user);

        let status = StatusService::new(pool.clone(), events.clone(), config.status_enabled);
        let webhooks = WebhookLedger::new(pool.clone());

        info!("application state constructed");

        Ok(Arc::new(Self {
            pool,
            config,
            events,
            users,
            admin_registry,
            draw_clock,
            presence,
            mute_store,
            notifications,
            push_devices,
            global_chat,
            trivia_chat,
            private_chat,
            e2ee,
            dm,
            groups,
            sse_hub,
            status,
            webhooks,
        }))
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
