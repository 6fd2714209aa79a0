// src/api/dm.rs
// HTTP + SSE surface for the E2EE direct-message layer (`/dm`).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/conversations", post(create_conversation).get(list_conversations))
        .route("/conversations/{id}", get(conversation_detail))
        .route("/conversations/{id}/messages", post(send).get(messages))
        .route("/messages/{id}/delivered", post(mark_delivered))
        .route("/messages/{id}/read", post(mark_read))
        .route("/keys/bundle", post(upload_bundle))
        .route("/keys/bundle/{user_id}", get(fetch_bundle))
        .route("/keys/claim-prekey", post(claim_prekey))
        .route("/devices", get(list_devices))
        .route("/devices/revoke", post(revoke_device))
}

#[derive(Debug, Deserialize)]
struct CreateConversationBody {
    peer_user_id: i64,
}

async fn create_conversation(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<CreateConversationBody>) -> AppResult<Json<crate::dm::ConversationView>> {
    Ok(Json(state.dm.create_conversation(user.user_id, body.peer_user_id).await?))
}

async fn list_conversations(State(state): State<Arc<AppState>>, user: AuthenticatedUser) -> AppResult<Json<Vec<crate::dm::ConversationView>>> {
    Ok(Json(state.dm.list_conversations(user.user_id).await?))
}

async fn conversation_detail(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>) -> AppResult<Json<crate::dm::ConversationView>> {
    Ok(Json(state.dm.conversation_detail(&id, user.user_id).await?))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    sender_device_id: String,
    ciphertext: String,
    proto: String,
    client_message_id: Option<String>,
}

async fn send(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>, Json(body): Json<SendBody>) -> AppResult<Json<crate::dm::SendResult>> {
    Ok(Json(
        state
            .dm
            .send(&id, user.user_id, &body.sender_device_id, &body.ciphertext, &body.proto, body.client_message_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<u32>,
    since: Option<DateTime<Utc>>,
}

async fn messages(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>, Query(query): Query<MessagesQuery>) -> AppResult<Json<Vec<crate::dm::MessageView>>> {
    Ok(Json(state.dm.messages(&id, user.user_id, query.limit.unwrap_or(50), query.since).await?))
}

async fn mark_delivered(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    state.dm.mark_delivered(&id, user.user_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn mark_read(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    state.dm.mark_read(&id, user.user_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct UploadBundleBody {
    device_id: String,
    device_name: Option<String>,
    identity_key_pub: String,
    signed_prekey_pub: String,
    signed_prekey_sig: String,
    one_time_prekeys: Vec<(i64, String)>,
}

async fn upload_bundle(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<UploadBundleBody>) -> AppResult<Json<crate::e2ee::BundleSummary>> {
    Ok(Json(
        state
            .e2ee
            .upload_bundle(
                &body.device_id,
                user.user_id,
                body.device_name.as_deref(),
                &body.identity_key_pub,
                &body.signed_prekey_pub,
                &body.signed_prekey_sig,
                &body.one_time_prekeys,
            )
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct FetchBundleQuery {
    known_bundle_version: Option<i64>,
}

async fn fetch_bundle(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(target_user_id): Path<i64>, Query(query): Query<FetchBundleQuery>) -> AppResult<Json<Vec<crate::e2ee::DeviceBundleView>>> {
    Ok(Json(state.e2ee.fetch_bundle(user.user_id, target_user_id, query.known_bundle_version).await?))
}

#[derive(Debug, Deserialize)]
struct ClaimPrekeyBody {
    device_id: String,
}

async fn claim_prekey(State(state): State<Arc<AppState>>, _user: AuthenticatedUser, Json(body): Json<ClaimPrekeyBody>) -> AppResult<Json<crate::e2ee::ClaimedPrekey>> {
    Ok(Json(state.e2ee.claim_prekey(&body.device_id).await?))
}

async fn list_devices(State(state): State<Arc<AppState>>, user: AuthenticatedUser) -> AppResult<Json<Vec<crate::e2ee::DeviceView>>> {
    Ok(Json(state.e2ee.list_devices(user.user_id).await?))
}

#[derive(Debug, Deserialize)]
struct RevokeDeviceBody {
    device_id: String,
    reason: String,
}

async fn revoke_device(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<RevokeDeviceBody>) -> AppResult<Json<serde_json::Value>> {
    state.e2ee.revoke_device(&body.device_id, user.user_id, &body.reason).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}
