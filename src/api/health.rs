// src/api/health.rs
// Health/readiness endpoints for load balancers and orchestrator probes.
// Grounded on the teacher's `api/http/health.rs`; Qdrant swapped for Redis
// since this crate's distributed dependency is the `EventBus`/rate-limit
// store, not a vector index.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    db: &'static str,
    redis: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    schema: &'static str,
}

/// GET /healthz
pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").fetch_one(&state.pool).await.is_ok();
    let redis_ok = state.events.is_connected();

    let response = HealthResponse {
        status: if db_ok { "healthy" } else { "unhealthy" },
        db: if db_ok { "ok" } else { "error" },
        redis: if redis_ok { "ok" } else { "degraded" },
    };

    if db_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// GET /readyz
pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let schema_ok = sqlx::query("SELECT 1 FROM users LIMIT 1").fetch_optional(&state.pool).await.is_ok();

    let response = ReadyResponse {
        status: if schema_ok { "ready" } else { "not_ready" },
        schema: if schema_ok { "applied" } else { "pending" },
    };

    if schema_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
