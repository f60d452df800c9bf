//! # reelbatch
//!
//! Resumable batch pipeline that acquires media for a list of URLs and submits each item
//! to a single remote analysis session.
//!
//! ## Design Philosophy
//!
//! - **Resumable** - a durable ledger records every finished URL; a crash or stop loses
//!   at most the items that were in flight
//! - **Bounded** - at most `batch_size` items hold a downloaded artifact at any moment
//! - **Pipelined** - acquisition of later items overlaps analysis of earlier ones
//! - **Serialized analysis** - the analysis session is used by one call at a time
//!
//! ## Quick Start
//!
//! ```no_run
//! use reelbatch::{BatchScheduler, CommandAcquirer, CommandAnalyzer, Config, Ledger};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("reelbatch.json".as_ref())?;
//!     let ledger = Arc::new(Ledger::open(&config.paths.ledger_path).await?);
//!     let urls = reelbatch::input::load_urls(&config.paths.input_file)?;
//!
//!     let scheduler = BatchScheduler::new(config.clone(), ledger)
//!         .with_acquirer(Arc::new(CommandAcquirer::from_config(&config.collaborators)?))
//!         .with_analyzer(Box::new(CommandAnalyzer::from_config(&config.collaborators)?));
//!
//!     // Subscribe to events
//!     let mut events = scheduler.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = reelbatch::run_until_signal(scheduler, urls).await?;
//!     println!("analyzed {} of {}", summary.analyzed, summary.total);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Analysis and acquisition collaborators
pub mod collaborators;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Input list loading
pub mod input;
/// Durable per-URL ledger
pub mod ledger;
/// Media artifacts on disk
pub mod media;
/// Retry logic with fixed or exponential backoff
pub mod retry;
/// Windowed batch scheduler
pub mod scheduler;
/// CSV result store
pub mod sink;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use collaborators::{
    AcquireRequest, Acquirer, Analyzer, CommandAcquirer, CommandAnalyzer, PromptConfig,
    StructuredResult,
};
pub use config::{Config, StageSelection};
pub use error::{
    AcquireError, AcquireErrorKind, AnalyzeError, AnalyzeErrorKind, DatabaseError, Error, Result,
};
pub use ledger::{Ledger, LedgerEntry, LedgerStatus, RunRecord};
pub use media::{MediaArtifact, SourcePlatform};
pub use scheduler::BatchScheduler;
pub use sink::ResultSink;
pub use types::{Event, ItemStatus, RunOutcome, RunSummary, WorkItem};

/// Run the scheduler, requesting a graceful stop on the first termination signal.
///
/// After the first signal nothing new is admitted; items already in the window finish and
/// the summary reports [`RunOutcome::Stopped`]. A second signal abandons the in-flight
/// items and returns [`Error::Interrupted`]; the ledger is left marked as an unclean
/// shutdown and the next run resumes from it.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_until_signal(scheduler: BatchScheduler, urls: Vec<String>) -> Result<RunSummary> {
    run_until(scheduler, urls, wait_for_signal).await
}

async fn run_until<F, S>(
    scheduler: BatchScheduler,
    urls: Vec<String>,
    mut next_signal: F,
) -> Result<RunSummary>
where
    F: FnMut() -> S,
    S: std::future::Future<Output = ()>,
{
    let stop = scheduler.stop_token();
    let signals = async move {
        next_signal().await;
        stop.cancel();
        tracing::info!("signal again to exit without waiting for in-flight items");
        next_signal().await;
        tracing::warn!("second signal received, abandoning in-flight items");
    };

    tokio::select! {
        result = scheduler.run(urls) => result,
        () = signals => Err(Error::Interrupted),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal, finishing in-flight items");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C), finishing in-flight items");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal, finishing in-flight items");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct WritingAcquirer;

    #[async_trait]
    impl Acquirer for WritingAcquirer {
        async fn acquire(
            &self,
            request: &AcquireRequest,
        ) -> std::result::Result<MediaArtifact, AcquireError> {
            tokio::fs::write(&request.destination, b"media").await.unwrap();
            Ok(MediaArtifact::new(&request.url, &request.destination, 5))
        }

        fn name(&self) -> &'static str {
            "writing"
        }
    }

    struct HangingAnalyzer;

    #[async_trait]
    impl Analyzer for HangingAnalyzer {
        async fn analyze(
            &mut self,
            _artifact: &MediaArtifact,
            _url: &str,
            _prompt: &PromptConfig,
        ) -> std::result::Result<StructuredResult, AnalyzeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StructuredResult::new().with("message", "late"))
        }

        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn second_signal_abandons_in_flight_items() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.artifact_dir = dir.path().join("downloads");
        config.paths.output_file = dir.path().join("output.csv");
        config.paths.ledger_path = dir.path().join("reelbatch.db");
        config.pipeline.batch_size = 1;
        config.pipeline.acquire_concurrency = 1;
        config.disk_space.enabled = false;
        let ledger = Arc::new(Ledger::open(&config.paths.ledger_path).await.unwrap());

        let scheduler = BatchScheduler::new(config, Arc::clone(&ledger))
            .with_acquirer(Arc::new(WritingAcquirer))
            .with_analyzer(Box::new(HangingAnalyzer));
        let mut events = scheduler.subscribe();
        let signal = Arc::new(Notify::new());
        let source = Arc::clone(&signal);
        let run = tokio::spawn(run_until(
            scheduler,
            vec!["https://www.tiktok.com/@a/video/7000000000000000001".to_string()],
            move || {
                let source = Arc::clone(&source);
                async move { source.notified().await }
            },
        ));

        loop {
            if let Event::AnalyzeStarted { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        signal.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished(), "first signal only stops admission");
        signal.notify_one();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("second signal should end the run")
            .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(err.exit_code(), error::exit_code::INTERRUPTED);
        assert!(ledger.was_unclean_shutdown().await.unwrap());
    }
}
