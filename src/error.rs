// src/error.rs
// Central error type for the HTTP/SSE boundary.
//
// Internal services return `anyhow::Result` (see auth/service.rs in the
// corpus this crate learned from); handlers convert the failure into an
// `AppError` carrying the HTTP status, machine-readable code, and message
// spec'd in the error-handling design: `{detail}` body plus `X-Error-Code`
// header for the conflict/authz codes callers need to branch on.

use axum::http::{HeaderValue, StatusCode, header::HeaderName};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{message}")]
    Authz { message: String, code: Option<&'static str> },

    #[error("feature-disabled")]
    FeatureDisabled,

    #[error("rate limited")]
    RateLimited { retry_after_seconds: u64 },

    #[error("too many concurrent streams")]
    TooManyStreams,

    #[error("{message}")]
    Conflict { code: &'static str, message: String, header: Option<(&'static str, String)> },

    #[error("{0}")]
    NotFound(String),

    #[error("blocked")]
    Blocked,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, extra_header) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, None, msg, None),
            AppError::Authz { message, code } => (StatusCode::FORBIDDEN, code, message, None),
            AppError::FeatureDisabled => (
                StatusCode::FORBIDDEN,
                None,
                "feature-disabled".to_string(),
                None,
            ),
            AppError::RateLimited { retry_after_seconds } => (
                StatusCode::TOO_MANY_REQUESTS,
                None,
                "rate limit exceeded".to_string(),
                Some(("Retry-After", retry_after_seconds.to_string())),
            ),
            AppError::TooManyStreams => (
                StatusCode::TOO_MANY_REQUESTS,
                None,
                "too many concurrent SSE connections for this user".to_string(),
                None,
            ),
            AppError::Conflict { code, message, header } => {
                (StatusCode::CONFLICT, Some(code), message, header)
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, None, msg, None),
            AppError::Blocked => (
                StatusCode::FORBIDDEN,
                Some("BLOCKED"),
                "blocked".to_string(),
                None,
            ),
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    "internal error".to_string(),
                    None,
                )
            }
        };

        let mut response = (status, Json(ErrorBody { detail: message })).into_response();

        if let Some(code) = code {
            if let Ok(value) = HeaderValue::from_str(code) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-error-code"), value);
            }
        }
        if let Some((name, value)) = extra_header {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name),
                HeaderValue::from_str(&value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn epoch_stale(current_epoch: i64) -> Self {
        AppError::Conflict {
            code: "EPOCH_STALE",
            message: "group epoch is stale".to_string(),
            header: Some(("X-Current-Epoch", current_epoch.to_string())),
        }
    }

    pub fn bundle_stale(current_version: i64) -> Self {
        AppError::Conflict {
            code: "BUNDLE_STALE",
            message: "key bundle is stale".to_string(),
            header: Some(("X-Bundle-Version", current_version.to_string())),
        }
    }

    pub fn prekeys_exhausted(bundle_version: i64) -> Self {
        AppError::Conflict {
            code: "PREKEYS_EXHAUSTED",
            message: "no one-time prekeys remain".to_string(),
            header: Some(("X-Bundle-Version", bundle_version.to_string())),
        }
    }

    pub fn device_revoked() -> Self {
        AppError::Conflict {
            code: "DEVICE_REVOKED",
            message: "device has been revoked".to_string(),
            header: None,
        }
    }

    pub fn identity_change_blocked() -> Self {
        AppError::Conflict {
            code: "IDENTITY_CHANGE_BLOCKED",
            message: "too many identity key changes".to_string(),
            header: None,
        }
    }

    pub fn relationship_required() -> Self {
        AppError::Authz {
            message: "a DM relationship with this user is required".to_string(),
            code: Some("RELATIONSHIP_REQUIRED"),
        }
    }

    pub fn authz(message: impl Into<String>) -> Self {
        AppError::Authz { message: message.into(), code: None }
    }

    pub fn group_full() -> Self {
        AppError::Conflict {
            code: "GROUP_FULL",
            message: "group is at capacity".to_string(),
            header: None,
        }
    }

    pub fn too_many_streams() -> Self {
        AppError::TooManyStreams
    }
}
