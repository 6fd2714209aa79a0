// src/api/misc.rs
// Small surfaces adjacent to the three chat rooms: per-user mute
// preferences and push device registration. Neither carries its own
// [MODULE] budget; they are exposed here rather than folded silently
// into the chat routers so a client can reach them without knowing
// which surface owns the underlying table.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::mute::{ChatSurface, MutePreferences};
use crate::push::DevicePlatform;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/mute-preferences", get(get_mute_preferences))
        .route("/mute-preferences/chat", post(set_chat_muted))
        .route("/mute-preferences/users", get(get_muted_users))
        .route("/mute-preferences/users/{user_id}", post(add_muted_user).delete(remove_muted_user))
        .route("/push/devices", post(register_device))
}

async fn get_mute_preferences(State(state): State<Arc<AppState>>, user: AuthenticatedUser) -> AppResult<Json<MutePreferences>> {
    Ok(Json(state.mute_store.get_or_create(user.user_id, true).await.map_err(AppError::Internal)?))
}

#[derive(Debug, Deserialize)]
struct SetChatMutedBody {
    surface: ChatSurface,
    muted: bool,
}

async fn set_chat_muted(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<SetChatMutedBody>) -> AppResult<Json<MutePreferences>> {
    let mut prefs = state.mute_store.get_or_create(user.user_id, true).await.map_err(AppError::Internal)?;
    match body.surface {
        ChatSurface::Global => prefs.global_chat_muted = body.muted,
        ChatSurface::Trivia => prefs.trivia_chat_muted = body.muted,
    }
    sqlx::query("UPDATE chat_mute_preferences SET global_chat_muted = ?, trivia_chat_muted = ? WHERE user_id = ?")
        .bind(prefs.global_chat_muted)
        .bind(prefs.trivia_chat_muted)
        .bind(user.user_id)
        .execute(&state.pool)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(Json(prefs))
}

async fn get_muted_users(State(state): State<Arc<AppState>>, user: AuthenticatedUser) -> AppResult<Json<Vec<i64>>> {
    Ok(Json(state.mute_store.get_muted_users(user.user_id).await.map_err(AppError::Internal)?))
}

async fn add_muted_user(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(target_id): Path<i64>) -> AppResult<Json<serde_json::Value>> {
    state.mute_store.add_muted_user(user.user_id, target_id).await.map_err(AppError::Internal)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn remove_muted_user(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Path(target_id): Path<i64>) -> AppResult<Json<serde_json::Value>> {
    state.mute_store.remove_muted_user(user.user_id, target_id).await.map_err(AppError::Internal)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct RegisterDeviceBody {
    player_id: String,
    platform: DevicePlatform,
}

async fn register_device(State(state): State<Arc<AppState>>, user: AuthenticatedUser, Json(body): Json<RegisterDeviceBody>) -> AppResult<Json<serde_json::Value>> {
    state
        .push_devices
        .register(user.user_id, &body.player_id, body.platform, state.config.notifications.max_devices_per_user)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(serde_json::json!({"ok": true})))
}
