//! Runtime state: shutdown tracking and WAL checkpointing.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Ledger;

impl Ledger {
    /// Check if the last run ended without [`Ledger::set_clean_shutdown`]
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM runtime_state WHERE key = 'clean_shutdown'
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to check shutdown state: {}",
                e
            )))
        })?;

        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark that a run is in progress
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_shutdown_flag("false").await
    }

    /// Mark that the run ended gracefully
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_shutdown_flag("true").await
    }

    async fn set_shutdown_flag(&self, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES ('clean_shutdown', ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::WriteFailed(format!(
                "Failed to update shutdown state: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Fold the write-ahead log into the main database file
    pub async fn checkpoint(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::WriteFailed(format!(
                    "Failed to checkpoint ledger: {}",
                    e
                )))
            })?;

        Ok(())
    }
}
