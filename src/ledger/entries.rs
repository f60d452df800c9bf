//! Per-URL outcomes: existence checks, idempotent recording, bulk load.

use crate::error::DatabaseError;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use super::{Ledger, LedgerEntry, LedgerStatus};

const SELECT_ENTRY: &str = r#"
    SELECT url, status, reason, result_ref, recorded_at, run_id
    FROM ledger_entries
"#;

const SELECT_ENTRY_BY_URL: &str = r#"
    SELECT url, status, reason, result_ref, recorded_at, run_id
    FROM ledger_entries
    WHERE url = ?
"#;

/// Decode one row, or `None` if any column is unusable
fn decode_entry(row: &SqliteRow) -> Option<LedgerEntry> {
    let url: String = row.try_get("url").ok()?;
    let status: i32 = row.try_get("status").ok()?;
    let recorded_at: i64 = row.try_get("recorded_at").ok()?;
    Some(LedgerEntry {
        status: LedgerStatus::from_i32(status)?,
        reason: row.try_get("reason").ok()?,
        result_ref: row.try_get("result_ref").ok()?,
        recorded_at: DateTime::<Utc>::from_timestamp(recorded_at, 0)?,
        run_id: row.try_get("run_id").ok()?,
        url,
    })
}

impl Ledger {
    /// Whether `url` has a `Done` entry
    pub async fn is_done(&self, url: &str) -> Result<bool> {
        let status: Option<i32> =
            sqlx::query_scalar("SELECT status FROM ledger_entries WHERE url = ?")
                .bind(url)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to look up ledger entry: {}",
                        e
                    )))
                })?;

        Ok(status == Some(LedgerStatus::Done.to_i32()))
    }

    /// Fetch the entry for `url`
    ///
    /// A row that exists but cannot be decoded is reported as absent.
    pub async fn get(&self, url: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(SELECT_ENTRY_BY_URL)
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to fetch ledger entry: {}",
                    e
                )))
            })?;

        Ok(row.as_ref().and_then(decode_entry))
    }

    /// Record that `url` was analyzed and its result stored at `result_ref`
    ///
    /// Durable on return. Returns the outcome the ledger holds afterwards, which is the
    /// first recorded one if `url` already had an entry from this run or a `Done` entry
    /// from any run.
    pub async fn mark_done(&self, url: &str, result_ref: Option<&str>) -> Result<LedgerEntry> {
        self.record(url, LedgerStatus::Done, None, result_ref).await
    }

    /// Record that `url` failed permanently for `reason`
    ///
    /// Same durability and idempotence as [`Ledger::mark_done`].
    pub async fn mark_failed(&self, url: &str, reason: &str) -> Result<LedgerEntry> {
        self.record(url, LedgerStatus::Failed, Some(reason), None)
            .await
    }

    async fn record(
        &self,
        url: &str,
        status: LedgerStatus,
        reason: Option<&str>,
        result_ref: Option<&str>,
    ) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().timestamp();
        let run_id = self.run_id.load(Ordering::SeqCst);

        // Only a Failed entry from an earlier run may be replaced
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (url, status, reason, result_ref, recorded_at, run_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                status = excluded.status,
                reason = excluded.reason,
                result_ref = excluded.result_ref,
                recorded_at = excluded.recorded_at,
                run_id = excluded.run_id
            WHERE ledger_entries.status = ? AND ledger_entries.run_id != excluded.run_id
            "#,
        )
        .bind(url)
        .bind(status.to_i32())
        .bind(reason)
        .bind(result_ref)
        .bind(now)
        .bind(run_id)
        .bind(LedgerStatus::Failed.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::WriteFailed(format!(
                "Failed to record outcome for {}: {}",
                url, e
            )))
        })?;

        if result.rows_affected() == 0 {
            tracing::debug!(url = %url, status = ?status, "ledger already holds an outcome, keeping it");
        }

        let row = sqlx::query(SELECT_ENTRY_BY_URL)
            .bind(url)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read back ledger entry: {}",
                    e
                )))
            })?;

        decode_entry(&row).ok_or_else(|| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Ledger entry for {} is unreadable",
                url
            )))
        })
    }

    /// Load every readable entry
    ///
    /// Rows that cannot be decoded are skipped with a warning.
    pub async fn load_all(&self) -> Result<HashMap<String, LedgerEntry>> {
        let rows = sqlx::query(SELECT_ENTRY)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to load ledger: {}",
                    e
                )))
            })?;

        let mut entries = HashMap::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in &rows {
            match decode_entry(row) {
                Some(entry) => {
                    entries.insert(entry.url.clone(), entry);
                }
                None => {
                    skipped += 1;
                    let url: Option<String> = row.try_get("url").ok();
                    tracing::warn!(url = ?url, "skipping unreadable ledger entry");
                }
            }
        }

        if skipped > 0 {
            tracing::warn!(skipped, loaded = entries.len(), "ledger loaded with unreadable entries");
        }
        Ok(entries)
    }

    /// Count entries by status
    pub async fn count(&self, status: LedgerStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE status = ?")
            .bind(status.to_i32())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count ledger entries: {}",
                    e
                )))
            })?;

        Ok(count.max(0) as u64)
    }
}
