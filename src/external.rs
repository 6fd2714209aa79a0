// src/external.rs
// Narrow trait interfaces to the collaborators §1 of the spec declares out
// of scope: auth issuance, the relational user entity's lifecycle, and
// trivia draw-time computation. The core depends only on these traits so it
// never reaches into the adjacent subsystems directly (see Design Notes:
// "no global singletons in the core", constructor-injected registry).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Cosmetic + identity fields the core reads off `User` without owning its
/// lifecycle.
#[derive(Debug, Clone)]
pub struct UserSummary {
    pub id: i64,
    pub display_name: Option<String>,
    pub email_local_part: Option<String>,
    pub is_admin: bool,
    pub avatar_ref: Option<String>,
    pub frame_ref: Option<String>,
    pub badge_ref: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: i64) -> anyhow::Result<Option<UserSummary>>;
    async fn get_users(&self, user_ids: &[i64]) -> anyhow::Result<Vec<UserSummary>>;
}

/// Trivia gameplay/scoring/draw-time computation lives in an adjacent
/// subsystem; the core only asks it two questions.
#[async_trait]
pub trait TriviaDrawClock: Send + Sync {
    async fn next_draw_time(&self) -> anyhow::Result<DateTime<Utc>>;
    async fn is_trivia_chat_active(&self, now: DateTime<Utc>) -> anyhow::Result<bool>;
}

/// Resolves the "admin user" pair used to auto-skip private-chat requests
/// straight to `accepted` (see Design Notes open question: the source reads
/// this from an `AdminUser`-shaped table, not a hardcoded id or `User` role).
#[async_trait]
pub trait AdminRegistry: Send + Sync {
    async fn admin_user_ids(&self) -> anyhow::Result<Vec<i64>>;

    async fn is_admin_pair(&self, a: i64, b: i64) -> anyhow::Result<bool> {
        let admins = self.admin_user_ids().await?;
        Ok(admins.contains(&a) || admins.contains(&b))
    }
}
