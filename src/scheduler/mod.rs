//! Batch scheduler: windowed, pipelined acquisition feeding one serialized analysis lane
//!
//! A run is three kinds of task connected by channels:
//!
//! - the **coordinator** (the task calling [`BatchScheduler::run`]) owns every
//!   [`WorkItem`](crate::types::WorkItem), the ledger writes, and the result sink
//! - **acquisition workers**, one short-lived task per admitted item, at most
//!   `acquire_concurrency` at a time, each retrying its own item
//! - the **analysis lane**, a single long-lived task that exclusively owns the
//!   [`Analyzer`] and handles one job at a time
//!
//! Workers and the lane report back over one channel; the coordinator is the only place
//! item state changes, so no item state is shared.
//!
//! ```text
//!  pending ──admit──▶ Acquiring ──worker──▶ Acquired ──lane──▶ Analyzing ──▶ Analyzed
//!                         │                                        │
//!                         └──────────────▶ Failed ◀────────────────┘
//! ```
//!
//! The window (`Acquiring + Acquired + Analyzing`) never exceeds `batch_size`. On every
//! step the coordinator first hands the next acquired item to an idle lane, then admits
//! new items.

mod acquire;
mod coordinator;
mod lane;

use crate::collaborators::{Acquirer, Analyzer};
use crate::config::{Config, StageSelection};
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::types::{Event, RunSummary};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use coordinator::Coordinator;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Drives one run over an input list
pub struct BatchScheduler {
    config: Arc<Config>,
    ledger: Arc<Ledger>,
    acquirer: Option<Arc<dyn Acquirer>>,
    analyzer: Option<Box<dyn Analyzer>>,
    event_tx: broadcast::Sender<Event>,
    stop: CancellationToken,
}

impl BatchScheduler {
    /// Create a scheduler over an open ledger
    pub fn new(config: Config, ledger: Arc<Ledger>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            ledger,
            acquirer: None,
            analyzer: None,
            event_tx,
            stop: CancellationToken::new(),
        }
    }

    /// Set the acquirer (required unless running analyze-only)
    pub fn with_acquirer(mut self, acquirer: Arc<dyn Acquirer>) -> Self {
        self.acquirer = Some(acquirer);
        self
    }

    /// Set the analyzer (required unless running download-only)
    pub fn with_analyzer(mut self, analyzer: Box<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Token that requests a graceful stop when cancelled
    ///
    /// After cancellation nothing new is admitted; items already in the window run to
    /// completion and the run returns [`RunOutcome::Stopped`](crate::types::RunOutcome::Stopped).
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// The configuration this scheduler runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process `urls` until every pending item is retired, a stop is requested, or the
    /// analysis session expires
    ///
    /// `urls` should already be de-duplicated; repeated URLs are dropped here as well.
    ///
    /// # Errors
    ///
    /// Returns an error for startup problems (invalid configuration, missing collaborator)
    /// and for systemic failures: the ledger or result store cannot be written, or the
    /// disk stays full with nothing left to reclaim. Per-item failures never surface here.
    pub async fn run(self, urls: Vec<String>) -> Result<RunSummary> {
        self.config.validate()?;
        let stages = self.config.stages();
        if stages.acquires() && self.acquirer.is_none() {
            return Err(Error::NotSupported(
                "an acquirer is required unless running analyze-only".into(),
            ));
        }
        if stages.analyzes() && self.analyzer.is_none() {
            return Err(Error::NotSupported(
                "an analyzer is required unless running download-only".into(),
            ));
        }
        if stages == StageSelection::AcquireOnly && self.analyzer.is_some() {
            tracing::debug!("download-only run, analyzer will not be used");
        }

        let analyzer = if stages.analyzes() {
            self.analyzer
        } else {
            None
        };

        let coordinator = Coordinator::start(
            self.config,
            self.ledger,
            self.acquirer,
            analyzer,
            self.event_tx,
            self.stop,
            urls,
        )
        .await?;
        coordinator.run().await
    }
}
