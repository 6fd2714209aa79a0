// src/api/private.rs
// HTTP surface for request/accept-gated private chat (`/private-chat`).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedUser;
use crate::chat::private::ConversationStatus;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/send", post(send))
        .route("/accept-reject", post(accept_reject))
        .route("/conversations", get(list_conversations))
        .route("/conversations/{id}", get(conversation_detail))
        .route("/conversations/{id}/messages", get(messages))
        .route("/conversations/{id}/mark-read", post(mark_read))
        .route("/conversations/{id}/typing", post(typing))
        .route("/conversations/{id}/typing-stop", post(typing_stop))
        .route("/messages/{id}/mark-delivered", post(mark_delivered))
        .route("/block", post(block))
        .route("/block/{user_id}", delete(unblock))
        .route("/blocks", get(list_blocks))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    recipient_user_id: i64,
    message: String,
    client_message_id: Option<String>,
    reply_to_message_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    conversation_id: i64,
    message_id: i64,
    created_at: DateTime<Utc>,
    duplicate: bool,
    status: ConversationStatus,
}

async fn send(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<SendBody>) -> AppResult<Json<SendResponse>> {
    let result = state
        .private_chat
        .send(user.user_id, body.recipient_user_id, &body.message, body.client_message_id, body.reply_to_message_id)
        .await?;
    Ok(Json(SendResponse {
        conversation_id: result.conversation_id,
        message_id: result.message_id,
        created_at: result.created_at,
        duplicate: result.duplicate,
        status: result.status,
    }))
}

#[derive(Debug, Deserialize)]
struct AcceptRejectBody {
    conversation_id: i64,
    action: String,
}

async fn accept_reject(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<AcceptRejectBody>) -> AppResult<Json<serde_json::Value>> {
    let accept = match body.action.as_str() {
        "accept" => true,
        "reject" => false,
        _ => return Err(AppError::Validation("action must be accept or reject".into())),
    };
    let status = state.private_chat.accept_reject(body.conversation_id, user.user_id, accept).await?;
    Ok(Json(serde_json::json!({"status": status})))
}

async fn list_conversations(State(state): State<Arc<AppState>>, user: AuthenticatedUser) -> AppResult<Json<Vec<crate::chat::private::ConversationSummary>>> {
    Ok(Json(state.private_chat.list_conversations(user.user_id).await?))
}

async fn conversation_detail(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<i64>) -> AppResult<Json<crate::chat::private::ConversationSummary>> {
    Ok(Json(state.private_chat.conversation_detail(id, user.user_id).await?))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<u32>,
}

async fn messages(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<i64>, Query(query): Query<MessagesQuery>) -> AppResult<Json<Vec<crate::chat::private::MessageView>>> {
    Ok(Json(state.private_chat.messages(id, user.user_id, query.limit.unwrap_or(50)).await?))
}

#[derive(Debug, Deserialize, Default)]
struct MarkReadBody {
    message_id: Option<i64>,
}

async fn mark_read(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<i64>, body: Option<Json<MarkReadBody>>) -> AppResult<Json<serde_json::Value>> {
    let message_id = body.map(|b| b.0.message_id).unwrap_or(None);
    state.private_chat.mark_read(id, user.user_id, message_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn typing(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<i64>) -> AppResult<Json<serde_json::Value>> {
    state.private_chat.typing(id, user.user_id, false).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn typing_stop(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<i64>) -> AppResult<Json<serde_json::Value>> {
    state.private_chat.typing(id, user.user_id, true).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn mark_delivered(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<i64>) -> AppResult<Json<serde_json::Value>> {
    state.private_chat.mark_delivered(id, user.user_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    user_id: i64,
}

async fn block(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<BlockBody>) -> AppResult<Json<serde_json::Value>> {
    state.private_chat.block(user.user_id, body.user_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn unblock(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(target_id): Path<i64>) -> AppResult<Json<serde_json::Value>> {
    state.private_chat.unblock(user.user_id, target_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn list_blocks(State(state): State<Arc<AppState>>, user: AuthenticatedUser) -> AppResult<Json<Vec<i64>>> {
    Ok(Json(state.private_chat.list_blocks(user.user_id).await?))
}
