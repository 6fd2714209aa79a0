// src/api/mod.rs
// Top-level router composition. Each chat surface owns its own nested
// router under a stable path prefix; this module only wires prefixes,
// CORS, and tracing, mirroring `mira-chat/src/server.rs`'s `create_router`.

pub mod dm;
pub mod global;
pub mod groups;
pub mod health;
pub mod misc;
pub mod private;
pub mod sse;
pub mod status;
pub mod trivia;

use std::sync::Arc;

use axum::http::{header, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::metrics_handler;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(metrics_handler))
        .nest("/global-chat", global::router())
        .nest("/trivia-live-chat", trivia::router())
        .nest("/private-chat", private::router())
        .nest("/dm", dm::router())
        .route("/dm/sse", get(sse::stream))
        .nest("/groups", groups::router())
        .nest("/status", status::router())
        .nest("/account", misc::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
