// src/auth/session.rs
//
// Session tokens are issued and signed by an external auth service (out of
// scope per the system overview); this module only decodes the opaque
// bearer token handed to us and trusts its `sub`/`exp` claims. Adapted from
// the corpus's JWT decode pattern, narrowed to verification only — there is
// no `create_token` here because issuance does not live in this crate.

use anyhow::{anyhow, Result};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: the authenticated user id, as a string on the wire.
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

impl SessionClaims {
    pub fn user_id(&self) -> Result<i64> {
        self.sub.parse().map_err(|_| anyhow!("non-numeric session subject"))
    }

    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now.timestamp() as usize >= self.exp
    }

    pub fn expires_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp(self.exp as i64, 0).unwrap_or_else(chrono::Utc::now)
    }
}

fn session_secret() -> String {
    env::var("SESSION_TOKEN_SECRET")
        .unwrap_or_else(|_| "pulsechat-dev-secret-do-not-use-in-production".to_string())
}

/// Decode and verify an opaque session token's signature and expiry claim.
/// Does not consult the relational store; that is the caller's job when the
/// resolved user needs to be loaded.
pub fn verify_session_token(token: &str) -> Result<SessionClaims> {
    let key = DecodingKey::from_secret(session_secret().as_bytes());
    let validation = Validation::default();

    decode::<SessionClaims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| anyhow!("invalid session token: {e}"))
}
