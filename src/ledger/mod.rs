//! Durable per-URL outcome ledger
//!
//! The ledger is the single source of truth for resume: a URL with a `Done` entry is never
//! processed again, and everything else the scheduler knows can be rebuilt from the ledger
//! plus the input list. It is a SQLite database in WAL mode with `synchronous = FULL`, so
//! a write is on disk when `mark_done` / `mark_failed` return.
//!
//! ## Submodules
//!
//! Methods on [`Ledger`] are organized by domain:
//! - `migrations` - Ledger lifecycle, schema migrations
//! - `entries` - Per-URL outcomes (`is_done`, `mark_done`, `mark_failed`, `load_all`)
//! - `runs` - Run history
//! - `state` - Runtime state (shutdown tracking, checkpointing)

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use std::sync::atomic::AtomicI64;
use tokio::sync::Mutex;

mod entries;
mod migrations;
mod runs;
mod state;

/// Terminal outcome stored for a URL
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Analyzed and written to the result store
    Done,
    /// Gave up on this URL; the reason is recorded
    Failed,
}

impl LedgerStatus {
    pub(crate) fn to_i32(self) -> i32 {
        match self {
            LedgerStatus::Done => 1,
            LedgerStatus::Failed => 2,
        }
    }

    pub(crate) fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(LedgerStatus::Done),
            2 => Some(LedgerStatus::Failed),
            _ => None,
        }
    }
}

/// One persisted outcome, keyed by URL
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedgerEntry {
    /// The input URL
    pub url: String,
    /// Terminal status
    pub status: LedgerStatus,
    /// Failure reason, for `Failed` entries
    pub reason: Option<String>,
    /// Where the result was written, for `Done` entries
    pub result_ref: Option<String>,
    /// When the outcome was recorded
    pub recorded_at: DateTime<Utc>,
    /// Run that recorded the outcome (0 when written outside a run)
    pub run_id: i64,
}

impl LedgerEntry {
    /// Whether this URL is finished for good
    pub fn is_done(&self) -> bool {
        self.status == LedgerStatus::Done
    }
}

/// A row of run history
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunRecord {
    /// Run id
    pub id: i64,
    /// When the run began
    pub started_at: DateTime<Utc>,
    /// When the run ended; `None` if it never finished cleanly
    pub finished_at: Option<DateTime<Utc>>,
    /// Final outcome label (`completed`, `stopped`, `session_expired`, `fatal`)
    pub outcome: Option<String>,
    /// Items analyzed during the run
    pub analyzed: i64,
    /// Items permanently failed during the run
    pub failed: i64,
}

/// Ledger handle
///
/// Reads go straight to the pool. Writes are serialized through `write_lock`, so
/// concurrent callers for distinct URLs never contend inside SQLite and callers for the
/// same URL observe a total order.
pub struct Ledger {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    run_id: AtomicI64,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
