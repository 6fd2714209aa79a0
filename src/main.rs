// src/main.rs
// Process entrypoint: load configuration, bootstrap AppState, mount the
// router from `api::create_router`, and serve. Mirrors `mira-chat/src/
// server.rs`'s `run()` plus `main.rs`'s env/logging bootstrap, adapted to
// this crate's constructor-injected `AppState` (see state.rs) instead of a
// single flat struct.

use std::sync::Arc;

use pulsechat_backend::config::CONFIG;
use pulsechat_backend::state::AppState;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_new(&CONFIG.logging.level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting pulsechat-backend");

    pulsechat_backend::metrics::init_metrics();

    let state = AppState::new(&CONFIG).await?;

    spawn_background_tasks(state.clone());

    let app = pulsechat_backend::api::create_router(state);
    let addr = CONFIG.bind_address();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic maintenance that does not belong on any request path: pruning
/// push devices OneSignal has told us are invalid (§4 SUPPLEMENTED
/// FEATURES — push-device invalidation feedback loop), mirroring the
/// corpus's `tasks/` background-loop pattern (`tasks/embedding_cleanup.rs`).
fn spawn_background_tasks(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(6 * 60 * 60));
        loop {
            ticker.tick().await;
            match state.push_devices.prune_invalid(30).await {
                Ok(pruned) if pruned > 0 => info!(pruned, "pruned invalid push devices"),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "push device prune failed"),
            }
            match state.status.cleanup().await {
                Ok(deleted) if deleted > 0 => info!(deleted, "swept expired status posts"),
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "status post sweep failed"),
            }
        }
    });
}
