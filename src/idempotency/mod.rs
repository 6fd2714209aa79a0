// src/idempotency/mod.rs (C6 IdempotencyGate)
//
// Client-supplied `clientMessageId` dedup. Uniqueness is enforced at the
// database layer (a unique index over the scope columns); this module only
// adds the pre-check and the single retry-after-conflict dance a race
// between the check and the insert can produce.

use anyhow::Result;
use sqlx::SqlitePool;

/// The scope a `clientMessageId` is unique within. Most surfaces only need
/// (surface, sender); private chat and trivia additionally scope by
/// conversation / draw date so the same id can't collide across them.
#[derive(Debug, Clone)]
pub struct IdempotencyScope {
    pub surface: &'static str,
    pub sender_id: i64,
    pub client_message_id: String,
    pub secondary_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyOutcome<T> {
    Fresh,
    Duplicate(T),
}

pub struct IdempotencyGate {
    pool: SqlitePool,
}

impl IdempotencyGate {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Looks up a prior result for this scope. The `result_id` column is
    /// stored as text so both the 64-bit-int legacy surfaces and the
    /// UUID-keyed E2EE surfaces share one table; callers parse it back to
    /// whatever type their surface uses.
    pub async fn check(&self, scope: &IdempotencyScope) -> Result<Option<String>> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT result_id FROM idempotency_keys
             WHERE surface = ? AND sender_id = ? AND client_message_id = ?
               AND secondary_key IS ?",
        )
        .bind(scope.surface)
        .bind(scope.sender_id)
        .bind(&scope.client_message_id)
        .bind(&scope.secondary_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Records the result of a fresh ingest so subsequent retries with the
    /// same `clientMessageId` short-circuit to it. Call this in the same
    /// transaction as the insert it guards where possible; a unique
    /// constraint violation here means a racing request won, in which case
    /// the caller should re-run `check` once and return that result.
    pub async fn record(&self, scope: &IdempotencyScope, result_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO idempotency_keys (surface, sender_id, client_message_id, secondary_key, result_id)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(scope.surface)
        .bind(scope.sender_id)
        .bind(&scope.client_message_id)
        .bind(&scope.secondary_key)
        .bind(result_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE idempotency_keys (
                surface TEXT NOT NULL,
                sender_id INTEGER NOT NULL,
                client_message_id TEXT NOT NULL,
                secondary_key TEXT,
                result_id TEXT NOT NULL,
                UNIQUE(surface, sender_id, client_message_id, secondary_key)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn fresh_then_duplicate() {
        let pool = test_pool().await;
        let gate = IdempotencyGate::new(pool);
        let scope = IdempotencyScope {
            surface: "global",
            sender_id: 1,
            client_message_id: "abc".to_string(),
            secondary_key: None,
        };

        assert!(gate.check(&scope).await.unwrap().is_none());
        gate.record(&scope, "99").await.unwrap();
        assert_eq!(gate.check(&scope).await.unwrap(), Some("99".to_string()));
    }

    #[tokio::test]
    async fn racing_insert_reports_unique_violation() {
        let pool = test_pool().await;
        let gate = IdempotencyGate::new(pool);
        let scope = IdempotencyScope {
            surface: "global",
            sender_id: 1,
            client_message_id: "abc".to_string(),
            secondary_key: None,
        };

        gate.record(&scope, "1").await.unwrap();
        let err = gate.record(&scope, "2").await.unwrap_err();
        let sqlx_err = err.downcast::<sqlx::Error>().unwrap();
        assert!(IdempotencyGate::is_unique_violation(&sqlx_err));
    }
}
