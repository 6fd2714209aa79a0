// src/api/sse.rs
// `/dm/sse` — the single multiplexed event stream (DM channel + every
// joined group channel). Token extraction is header-first with an
// optional query-string fallback because `EventSource` cannot set
// request headers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::request::Parts;
use axum::response::sse::{Event, Sse};
use serde::Deserialize;

use crate::auth::{sse_token, verify_session_token};
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    token: Option<String>,
}

pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SseQuery>,
    request: axum::extract::Request,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>>, AppError> {
    let (parts, _body): (Parts, _) = request.into_parts();
    let token = sse_token(&parts, query.token.as_deref(), state.config.e2ee.sse_allow_query_token)
        .map_err(|(_, msg)| AppError::authz(msg))?;
    let claims = verify_session_token(token).map_err(|_| AppError::authz("invalid or expired session token"))?;
    if claims.is_expired(chrono::Utc::now()) {
        return Err(AppError::authz("session token expired"));
    }
    let user_id = claims.user_id().map_err(|_| AppError::authz("malformed session subject"))?;

    state.sse_hub.stream(user_id, claims).await
}
