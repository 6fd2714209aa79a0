// src/api/status.rs
// `POST /status`, `GET /status/feed` — ephemeral status posts (§4).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(create)).route("/feed", get(feed))
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    ttl_hours: i64,
}

async fn create(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<CreateBody>) -> AppResult<Json<crate::status::StatusPostView>> {
    Ok(Json(state.status.create(user.user_id, body.ttl_hours).await?))
}

async fn feed(State(state): State<Arc<AppState>>, user: AuthenticatedUser) -> AppResult<Json<Vec<crate::status::StatusPostView>>> {
    Ok(Json(state.status.active_for(user.user_id).await?))
}
