// src/api/groups.rs
// HTTP surface for E2EE group conversations (`/groups`).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::groups::Role;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_group).get(list_groups))
        .route("/{id}", get(group_detail).patch(update_group))
        .route("/{id}/close", post(close_group))
        .route("/{id}/members", get(list_members).post(add_member))
        .route("/{id}/members/{user_id}", axum::routing::delete(remove_member))
        .route("/{id}/members/{user_id}/role", post(set_role))
        .route("/{id}/members/{user_id}/ban", post(ban_member))
        .route("/{id}/members/{user_id}/unban", post(unban_member))
        .route("/{id}/messages", post(send).get(messages))
        .route("/{id}/invites", post(create_invite))
        .route("/join/{code}", post(join_by_invite))
}

#[derive(Debug, Deserialize)]
struct CreateGroupBody {
    title: String,
    about: Option<String>,
    photo_url: Option<String>,
}

async fn create_group(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<CreateGroupBody>) -> AppResult<Json<crate::groups::GroupView>> {
    Ok(Json(state.groups.create_group(user.user_id, &body.title, body.about, body.photo_url).await?))
}

async fn list_groups(State(state): State<Arc<AppState>>, user: AuthenticatedUser) -> AppResult<Json<Vec<crate::groups::GroupView>>> {
    Ok(Json(state.groups.list_groups(user.user_id).await?))
}

async fn group_detail(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>) -> AppResult<Json<crate::groups::GroupView>> {
    Ok(Json(state.groups.group_detail(&id, user.user_id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct UpdateGroupBody {
    title: Option<String>,
    about: Option<Option<String>>,
    photo_url: Option<Option<String>>,
}

async fn update_group(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>, Json(body): Json<UpdateGroupBody>) -> AppResult<Json<crate::groups::GroupView>> {
    Ok(Json(state.groups.update_group(&id, user.user_id, body.title, body.about, body.photo_url).await?))
}

async fn close_group(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>) -> AppResult<Json<serde_json::Value>> {
    state.groups.close_group(&id, user.user_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn list_members(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>) -> AppResult<Json<Vec<crate::groups::ParticipantView>>> {
    Ok(Json(state.groups.list_members(&id, user.user_id).await?))
}

#[derive(Debug, Deserialize)]
struct AddMemberBody {
    target_user_id: i64,
}

async fn add_member(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>, Json(body): Json<AddMemberBody>) -> AppResult<Json<crate::groups::GroupView>> {
    Ok(Json(state.groups.add_member(&id, user.user_id, body.target_user_id).await?))
}

async fn remove_member(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path((id, target_user_id)): Path<(String, i64)>) -> AppResult<Json<crate::groups::GroupView>> {
    Ok(Json(state.groups.remove_member(&id, user.user_id, target_user_id).await?))
}

#[derive(Debug, Deserialize)]
struct SetRoleBody {
    role: Role,
}

async fn set_role(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path((id, target_user_id)): Path<(String, i64)>, Json(body): Json<SetRoleBody>) -> AppResult<Json<serde_json::Value>> {
    state.groups.set_role(&id, user.user_id, target_user_id, body.role).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize, Default)]
struct BanBody {
    reason: Option<String>,
}

async fn ban_member(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path((id, target_user_id)): Path<(String, i64)>, body: Option<Json<BanBody>>) -> AppResult<Json<crate::groups::GroupView>> {
    let reason = body.and_then(|b| b.0.reason);
    Ok(Json(state.groups.ban_member(&id, user.user_id, target_user_id, reason).await?))
}

async fn unban_member(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path((id, target_user_id)): Path<(String, i64)>) -> AppResult<Json<crate::groups::GroupView>> {
    Ok(Json(state.groups.unban_member(&id, user.user_id, target_user_id).await?))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    sender_device_id: String,
    claimed_epoch: i64,
    ciphertext: String,
    proto: String,
    reply_to_id: Option<String>,
    client_message_id: Option<String>,
}

async fn send(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>, Json(body): Json<SendBody>) -> AppResult<Json<crate::groups::SendResult>> {
    Ok(Json(
        state
            .groups
            .send(
                &id,
                user.user_id,
                &body.sender_device_id,
                body.claimed_epoch,
                &body.ciphertext,
                &body.proto,
                body.reply_to_id,
                body.client_message_id,
            )
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<u32>,
    before: Option<DateTime<Utc>>,
}

async fn messages(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>, Query(query): Query<MessagesQuery>) -> AppResult<Json<Vec<crate::groups::MessageView>>> {
    Ok(Json(state.groups.messages(&id, user.user_id, query.limit.unwrap_or(50), query.before).await?))
}

#[derive(Debug, Deserialize)]
struct CreateInviteBody {
    invite_type: String,
    max_uses: Option<i64>,
    target_user_id: Option<i64>,
}

async fn create_invite(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(id): Path<String>, Json(body): Json<CreateInviteBody>) -> AppResult<Json<crate::groups::InviteView>> {
    Ok(Json(state.groups.create_invite(&id, user.user_id, &body.invite_type, body.max_uses, body.target_user_id).await?))
}

async fn join_by_invite(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(code): Path<String>) -> AppResult<Json<crate::groups::GroupView>> {
    Ok(Json(state.groups.join_by_invite(&code, user.user_id).await?))
}
