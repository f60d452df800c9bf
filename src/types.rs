//! Core types: work items, run outcome, lifecycle events

use crate::error::exit_code;
use crate::media::{MediaArtifact, SourcePlatform};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a work item stands in the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Not yet admitted into the window
    Pending,
    /// An acquisition worker is fetching the media
    Acquiring,
    /// Artifact on disk, waiting for the analysis lane
    Acquired,
    /// Submitted to the analysis lane
    Analyzing,
    /// Result stored and ledger updated
    Analyzed,
    /// Given up on; reason stored in the ledger
    Failed,
}

impl ItemStatus {
    /// Whether the item occupies a window slot in this status
    pub fn in_window(self) -> bool {
        matches!(
            self,
            ItemStatus::Acquiring | ItemStatus::Acquired | ItemStatus::Analyzing
        )
    }

    /// Whether the item is finished for this run
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Analyzed | ItemStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// Returning to `Pending` is only legal from window states: it is how items are
    /// released when the analysis session expires.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Acquiring)
                | (Pending, Acquired)
                | (Acquiring, Acquired)
                | (Acquiring, Failed)
                | (Acquiring, Pending)
                | (Acquired, Analyzing)
                | (Acquired, Pending)
                | (Analyzing, Analyzed)
                | (Analyzing, Failed)
                | (Analyzing, Pending)
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Acquiring => "acquiring",
            ItemStatus::Acquired => "acquired",
            ItemStatus::Analyzing => "analyzing",
            ItemStatus::Analyzed => "analyzed",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One input URL's progress through the pipeline
///
/// Only the scheduler's coordinator mutates work items.
#[derive(Debug)]
pub struct WorkItem {
    /// Input URL, unique within a run
    pub url: String,
    /// Platform derived from the URL
    pub platform: SourcePlatform,
    /// Current status
    pub status: ItemStatus,
    /// Acquisition attempts made
    pub acquire_attempts: u32,
    /// Analysis attempts made
    pub analyze_attempts: u32,
    /// The artifact, while the coordinator holds it
    pub artifact: Option<MediaArtifact>,
}

impl WorkItem {
    /// A fresh pending item
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            platform: SourcePlatform::detect(&url),
            url,
            status: ItemStatus::Pending,
            acquire_attempts: 0,
            analyze_attempts: 0,
            artifact: None,
        }
    }

    /// Move to `next`
    ///
    /// An illegal transition is a scheduler bug: it is logged, asserted in debug
    /// builds, and applied anyway so the run can finish.
    pub fn transition(&mut self, next: ItemStatus) {
        if !self.status.can_transition_to(next) {
            tracing::error!(
                url = %self.url,
                from = %self.status,
                to = %next,
                "illegal work item transition"
            );
            debug_assert!(false, "illegal transition {} -> {}", self.status, next);
        }
        self.status = next;
    }
}

/// How a run ended, when it did not end with an error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every admitted item reached a terminal state
    Completed,
    /// A stop was requested; the window drained and the rest stays pending
    Stopped,
    /// The analysis session expired; un-analyzed items stay pending
    SessionExpired,
}

impl RunOutcome {
    /// Label stored in run history
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Stopped => "stopped",
            RunOutcome::SessionExpired => "session_expired",
        }
    }

    /// Process exit code for this outcome
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Completed | RunOutcome::Stopped => exit_code::SUCCESS,
            RunOutcome::SessionExpired => exit_code::SESSION_EXPIRED,
        }
    }
}

/// Counters and outcome of one run
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Ledger run id
    pub run_id: i64,
    /// Unique URLs in the input
    pub total: usize,
    /// Skipped because the ledger already has them as done
    pub skipped_done: usize,
    /// Skipped because an earlier run failed them and retries of failures are off
    pub skipped_failed: usize,
    /// Items admitted into the window
    pub admitted: usize,
    /// Items whose media was fetched by the acquirer
    pub acquired: usize,
    /// Items that reused an artifact already on disk
    pub reused: usize,
    /// Items analyzed and recorded
    pub analyzed: usize,
    /// Items permanently failed this run
    pub failed: usize,
    /// Items left pending at the end of the run
    pub unfinished: usize,
    /// Analyze-only items with no artifact on disk
    pub missing_artifacts: usize,
    /// Artifacts that could not be deleted
    pub reclaim_failures: usize,
    /// Wall-clock duration
    pub duration: Duration,
    /// How the run ended; `None` only while running
    pub outcome: Option<RunOutcome>,
}

/// Lifecycle event broadcast by the scheduler
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Scheduling is about to start
    RunStarted {
        /// Ledger run id
        run_id: i64,
        /// Items that will be scheduled
        pending: usize,
    },

    /// An item took a window slot
    Admitted {
        /// Item URL
        url: String,
        /// Window occupancy including this item
        in_window: usize,
    },

    /// An acquisition worker started on an item
    AcquireStarted {
        /// Item URL
        url: String,
    },

    /// An artifact is ready for analysis
    Acquired {
        /// Item URL
        url: String,
        /// True when an existing artifact was reused
        reused: bool,
    },

    /// The analysis lane took an item
    AnalyzeStarted {
        /// Item URL
        url: String,
    },

    /// An item's result was stored and recorded
    Analyzed {
        /// Item URL
        url: String,
        /// Where the result row was written
        result_ref: String,
    },

    /// An item failed permanently
    ItemFailed {
        /// Item URL
        url: String,
        /// Stage that failed (`acquire` or `analyze`)
        stage: String,
        /// Failure detail
        reason: String,
    },

    /// An item left the window
    Retired {
        /// Item URL
        url: String,
        /// Status the item retired with
        status: ItemStatus,
        /// Window occupancy after removal
        in_window: usize,
    },

    /// An artifact was deleted
    Reclaimed {
        /// Item URL
        url: String,
    },

    /// The analysis session expired; nothing new will be analyzed
    SessionExpired {
        /// URL whose analysis reported the expiry
        url: String,
    },

    /// The run ended
    RunFinished {
        /// Final counters
        summary: RunSummary,
    },
}
