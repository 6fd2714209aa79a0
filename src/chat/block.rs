// src/chat/block.rs
// Bidirectional-enforcement, direction-aware-listing block repository.
// Grounded on `utils/chat_blocking.py`'s `check_blocked` helper: enforcement
// treats either direction as a block, but the "my blocks" listing only
// returns rows the caller created (see SPEC_FULL.md §4 supplemented
// features).

use sqlx::SqlitePool;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct BlockRow {
    pub blocker_id: i64,
    pub blocked_id: i64,
}

pub struct BlockRepo {
    pool: SqlitePool,
}

impl BlockRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn block(&self, blocker_id: i64, blocked_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO blocks (blocker_id, blocked_id) VALUES (?, ?)
             ON CONFLICT(blocker_id, blocked_id) DO NOTHING",
        )
        .bind(blocker_id)
        .bind(blocked_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unblock(&self, blocker_id: i64, blocked_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM blocks WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker_id)
            .bind(blocked_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Enforcement check: true if either direction has blocked the other.
    pub async fn is_blocked_either_direction(&self, a: i64, b: i64) -> anyhow::Result<bool> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM blocks WHERE (blocker_id = ? AND blocked_id = ?) OR (blocker_id = ? AND blocked_id = ?) LIMIT 1",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Listing: only blocks the caller placed, not blocks placed on them.
    pub async fn list_blocked_by(&self, blocker_id: i64) -> anyhow::Result<Vec<BlockRow>> {
        let rows = sqlx::query_as::<_, BlockRow>("SELECT blocker_id, blocked_id FROM blocks WHERE blocker_id = ?")
            .bind(blocker_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::ensure_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn enforcement_is_bidirectional_but_listing_is_not() {
        let pool = test_pool().await;
        let repo = BlockRepo::new(pool);
        repo.block(1, 2).await.unwrap();

        assert!(repo.is_blocked_either_direction(1, 2).await.unwrap());
        assert!(repo.is_blocked_either_direction(2, 1).await.unwrap());

        assert_eq!(repo.list_blocked_by(1).await.unwrap().len(), 1);
        assert!(repo.list_blocked_by(2).await.unwrap().is_empty());
    }
}
