// src/auth/extractor.rs
// Axum extractor that turns a bearer token into a verified, non-expired
// session. REST endpoints use this directly; the SSE endpoint has its own
// token extraction (header, with a flag-gated query fallback) because
// `EventSource` cannot set request headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

use super::session::{verify_session_token, SessionClaims};
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub claims: SessionClaims,
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::authz("missing or malformed Authorization header"))?;

        let claims = verify_session_token(token)
            .map_err(|_| AppError::authz("invalid or expired session token"))?;

        if claims.is_expired(chrono::Utc::now()) {
            return Err(AppError::authz("session token expired"));
        }

        let user_id = claims
            .user_id()
            .map_err(|_| AppError::authz("malformed session subject"))?;

        Ok(AuthenticatedUser { user_id, claims })
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let header = parts.headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

/// Used only by the SSE handler, which accepts the header form always and
/// the query-string form only when `E2EESSEAllowQueryToken` is set.
pub fn sse_token<'a>(parts: &'a Parts, query_token: Option<&'a str>, allow_query: bool) -> Result<&'a str, (StatusCode, &'static str)> {
    if let Some(token) = bearer_token(parts) {
        return Ok(token);
    }
    if allow_query {
        if let Some(token) = query_token {
            return Ok(token);
        }
    }
    Err((StatusCode::UNAUTHORIZED, "missing session token"))
}
