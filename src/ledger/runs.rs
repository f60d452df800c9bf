//! Run history: one row per scheduler run.

use crate::error::DatabaseError;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::sync::atomic::Ordering;

use super::{Ledger, RunRecord};

#[derive(FromRow)]
struct RunRow {
    id: i64,
    started_at: i64,
    finished_at: Option<i64>,
    outcome: Option<String>,
    analyzed: i64,
    failed: i64,
}

impl From<RunRow> for RunRecord {
    fn from(row: RunRow) -> Self {
        RunRecord {
            id: row.id,
            started_at: DateTime::<Utc>::from_timestamp(row.started_at, 0).unwrap_or_default(),
            finished_at: row
                .finished_at
                .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            outcome: row.outcome,
            analyzed: row.analyzed,
            failed: row.failed,
        }
    }
}

impl Ledger {
    /// Start a new run and make it the owner of subsequent writes
    ///
    /// Also clears the clean-shutdown flag; [`Ledger::finish_run`] sets it again.
    pub async fn begin_run(&self) -> Result<i64> {
        let guard = self.write_lock.lock().await;
        let now = Utc::now().timestamp();

        let result = sqlx::query("INSERT INTO runs (started_at) VALUES (?)")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::WriteFailed(format!(
                    "Failed to start run: {}",
                    e
                )))
            })?;

        let id = result.last_insert_rowid();
        self.run_id.store(id, Ordering::SeqCst);
        drop(guard);

        self.set_clean_start().await?;
        Ok(id)
    }

    /// Id of the run started by [`Ledger::begin_run`], 0 before that
    pub fn current_run_id(&self) -> i64 {
        self.run_id.load(Ordering::SeqCst)
    }

    /// Close the current run with its outcome and counts, and mark the shutdown clean
    pub async fn finish_run(&self, outcome: &str, analyzed: u64, failed: u64) -> Result<()> {
        self.record_run_outcome(outcome, analyzed, failed).await?;
        self.set_clean_shutdown().await
    }

    /// Record the current run's outcome and counts without touching the shutdown flag
    ///
    /// Used for runs that end in a fatal error, so the next start still sees an
    /// unclean shutdown.
    pub async fn record_run_outcome(
        &self,
        outcome: &str,
        analyzed: u64,
        failed: u64,
    ) -> Result<()> {
        let id = self.current_run_id();
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            UPDATE runs SET finished_at = ?, outcome = ?, analyzed = ?, failed = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(outcome)
        .bind(analyzed as i64)
        .bind(failed as i64)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::WriteFailed(format!(
                "Failed to finish run {}: {}",
                id, e
            )))
        })?;
        Ok(())
    }

    /// Most recent runs, newest first
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT id, started_at, finished_at, outcome, analyzed, failed
            FROM runs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list runs: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(RunRecord::from).collect())
    }
}
