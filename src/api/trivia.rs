// src/api/trivia.rs
// HTTP surface for the trivia-live chat room (`/trivia-live-chat`).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/send", post(send))
        .route("/messages", get(messages))
        .route("/status", get(status))
        .route("/like", post(like))
        .route("/likes", get(likes))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    message: String,
    client_message_id: Option<String>,
    reply_to_message_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    message_id: i64,
    created_at: DateTime<Utc>,
    duplicate: bool,
}

async fn send(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<SendBody>) -> AppResult<Json<SendResponse>> {
    let result = state
        .trivia_chat
        .send(user.user_id, &body.message, body.client_message_id, body.reply_to_message_id)
        .await?;
    Ok(Json(SendResponse { message_id: result.message_id, created_at: result.created_at, duplicate: result.duplicate }))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct MessagesResponse {
    messages: Vec<crate::chat::trivia::TriviaMessageView>,
    is_active: bool,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

async fn messages(State(state): State<Arc<AppState>>, _user: AuthenticatedUser, Query(query): Query<MessagesQuery>) -> AppResult<Json<MessagesResponse>> {
    let (messages, is_active, window_start, window_end) = state.trivia_chat.messages(query.limit.unwrap_or(50)).await?;
    Ok(Json(MessagesResponse { messages, is_active, window_start, window_end }))
}

async fn status(State(state): State<Arc<AppState>>, _user: AuthenticatedUser) -> AppResult<Json<crate::chat::trivia::StatusView>> {
    Ok(Json(state.trivia_chat.status().await?))
}

#[derive(Debug, Deserialize)]
struct LikeBody {
    message_id: Option<i64>,
}

async fn like(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<LikeBody>) -> AppResult<Json<serde_json::Value>> {
    state.trivia_chat.like(user.user_id, body.message_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn likes(State(state): State<Arc<AppState>>, _user: AuthenticatedUser) -> AppResult<Json<serde_json::Value>> {
    let count = state.trivia_chat.likes().await?;
    Ok(Json(serde_json::json!({"likeCount": count})))
}
