// src/webhook.rs
// `WebhookEvent` idempotency log (§3): external event streams (the push
// provider's delivery-status callbacks, most concretely) hand us an
// `eventId`; this ledger makes replays a no-op rather than a double-apply.
// Not one of the twelve budgeted components — a minimal record/mark ledger
// is what the entity needs and no more.

use serde::Serialize;
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Received,
    Processed,
    Failed,
}

impl WebhookStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

pub struct WebhookLedger {
    pool: SqlitePool,
}

impl WebhookLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records the event if unseen. Returns `false` when `event_id` is a
    /// replay, so the caller can skip re-applying its side effect.
    pub async fn record_if_new(&self, event_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("INSERT INTO webhook_events (event_id, status) VALUES (?, 'received') ON CONFLICT(event_id) DO NOTHING")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark(&self, event_id: &str, status: WebhookStatus, last_error: Option<&str>) -> anyhow::Result<()> {
        sqlx::query("UPDATE webhook_events SET status = ?, last_error = ? WHERE event_id = ?")
            .bind(status.as_str())
            .bind(last_error)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
