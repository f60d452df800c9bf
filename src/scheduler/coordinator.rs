//! The coordinator loop: owns item state, the window, the ledger writes and the sink.

use super::acquire::{AcquireReport, spawn_acquisition};
use super::lane::{AnalysisJob, AnalysisLane, AnalyzeReport};
use crate::collaborators::{AcquireRequest, Acquirer, Analyzer};
use crate::config::{Config, StageSelection};
use crate::error::{Error, Result};
use crate::ledger::{Ledger, LedgerStatus};
use crate::media::{self, MediaArtifact};
use crate::retry::RetryPolicy;
use crate::sink::{self, ResultSink};
use crate::types::{Event, ItemStatus, RunOutcome, RunSummary, WorkItem};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Messages from workers and the lane back to the coordinator
pub(super) enum Report {
    Acquired(AcquireReport),
    Analyzed(AnalyzeReport),
}

/// Why admission has stopped for the rest of the run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Halt {
    /// Stop requested: drain the window, admit nothing
    Stopped,
    /// Analysis session expired: analyze nothing more, release acquired items
    SessionExpired,
}

pub(super) struct Coordinator {
    config: Arc<Config>,
    stages: StageSelection,
    ledger: Arc<Ledger>,
    sink: Option<ResultSink>,
    acquirer: Option<Arc<dyn Acquirer>>,
    acquire_policy: RetryPolicy,
    lane: Option<AnalysisLane>,

    pending: VecDeque<WorkItem>,
    window: HashMap<String, WorkItem>,
    /// Artifact path claimed by each item in the window
    destinations: HashMap<String, PathBuf>,
    ready: VecDeque<String>,
    acquiring: usize,
    analyzing: Option<String>,

    reports_tx: mpsc::UnboundedSender<Report>,
    reports_rx: mpsc::UnboundedReceiver<Report>,
    event_tx: broadcast::Sender<Event>,
    stop: CancellationToken,
    halt: Option<Halt>,
    space_blocked: bool,
    summary: RunSummary,
    started: Instant,
}

impl Coordinator {
    /// Open the run: ledger bookkeeping, sink reconciliation, pending set, orphan sweep
    pub async fn start(
        config: Arc<Config>,
        ledger: Arc<Ledger>,
        acquirer: Option<Arc<dyn Acquirer>>,
        analyzer: Option<Box<dyn Analyzer>>,
        event_tx: broadcast::Sender<Event>,
        stop: CancellationToken,
        urls: Vec<String>,
    ) -> Result<Self> {
        let started = Instant::now();
        let stages = config.stages();

        if ledger.was_unclean_shutdown().await? {
            tracing::warn!("previous run did not shut down cleanly, resuming from ledger");
        }
        let run_id = ledger.begin_run().await?;

        let sink = if stages.analyzes() {
            // Reconcile first: opening the store trims a torn last row
            reconcile(&ledger, &config.paths.output_file).await?;
            Some(ResultSink::open(
                &config.paths.output_file,
                &config.result_columns,
            )?)
        } else {
            None
        };

        let entries = ledger.load_all().await?;
        let mut summary = RunSummary {
            run_id,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut pending = VecDeque::new();
        for url in urls {
            if !seen.insert(url.clone()) {
                continue;
            }
            summary.total += 1;
            match entries.get(&url).map(|e| e.status) {
                Some(LedgerStatus::Done) => summary.skipped_done += 1,
                Some(LedgerStatus::Failed) if !config.pipeline.retry_failed => {
                    summary.skipped_failed += 1
                }
                _ => pending.push_back(WorkItem::new(url)),
            }
        }

        let artifact_dir = &config.paths.artifact_dir;
        if !config.keeps_artifacts() {
            let done = entries
                .values()
                .filter(|e| e.is_done())
                .map(|e| e.url.as_str());
            let wanted = pending.iter().map(|item| item.url.as_str());
            if let Err(e) = media::sweep_orphans(artifact_dir, done, wanted).await {
                tracing::warn!(error = %e, dir = %artifact_dir.display(), "artifact sweep failed");
            }
        }
        if stages.acquires() {
            tokio::fs::create_dir_all(artifact_dir).await?;
        }

        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let lane = analyzer.map(|analyzer| {
            let columns = sink
                .as_ref()
                .map(|s| s.columns().to_vec())
                .unwrap_or_else(|| config.result_columns.clone());
            AnalysisLane::spawn(
                analyzer,
                RetryPolicy::new(&config.analyze_retry),
                config.prompt.clone(),
                columns,
                reports_tx.clone(),
            )
        });

        tracing::info!(
            run_id,
            total = summary.total,
            pending = pending.len(),
            skipped_done = summary.skipped_done,
            skipped_failed = summary.skipped_failed,
            batch_size = config.pipeline.batch_size,
            acquire_concurrency = config.pipeline.acquire_concurrency,
            stages = ?stages,
            "run started"
        );
        let _ = event_tx.send(Event::RunStarted {
            run_id,
            pending: pending.len(),
        });

        Ok(Self {
            acquire_policy: RetryPolicy::new(&config.acquire_retry),
            config,
            stages,
            ledger,
            sink,
            acquirer,
            lane,
            pending,
            window: HashMap::new(),
            destinations: HashMap::new(),
            ready: VecDeque::new(),
            acquiring: 0,
            analyzing: None,
            reports_tx,
            reports_rx,
            event_tx,
            stop,
            halt: None,
            space_blocked: false,
            summary,
            started,
        })
    }

    /// Drive the run to its end
    pub async fn run(mut self) -> Result<RunSummary> {
        match self.drive().await {
            Ok(()) => self.finish().await,
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            self.fill().await?;

            if self.window.is_empty() && (self.pending.is_empty() || self.halt.is_some()) {
                return Ok(());
            }
            if self.window.is_empty() {
                // Nothing in flight could ever send a report
                return Err(Error::Other(format!(
                    "{} pending items but none could be admitted",
                    self.pending.len()
                )));
            }

            tokio::select! {
                _ = self.stop.cancelled(), if self.halt.is_none() => {
                    tracing::info!(
                        in_window = self.window.len(),
                        pending = self.pending.len(),
                        "stop requested, draining window"
                    );
                    self.halt = Some(Halt::Stopped);
                }
                report = self.reports_rx.recv() => match report {
                    Some(Report::Acquired(report)) => self.on_acquired(report).await?,
                    Some(Report::Analyzed(report)) => self.on_analyzed(report).await?,
                    // The coordinator holds a sender, so the channel never closes
                    None => return Ok(()),
                },
            }
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    /// Keep the lane busy first, then admit new items
    async fn fill(&mut self) -> Result<()> {
        self.dispatch_analysis()?;
        self.admit().await?;
        self.dispatch_analysis()
    }

    fn dispatch_analysis(&mut self) -> Result<()> {
        if self.analyzing.is_some() || self.halt == Some(Halt::SessionExpired) {
            return Ok(());
        }
        let Some(lane) = &self.lane else {
            return Ok(());
        };
        let Some(url) = self.ready.pop_front() else {
            return Ok(());
        };
        let Some(item) = self.window.get_mut(&url) else {
            tracing::error!(url = %url, "ready item is not in the window");
            return Ok(());
        };
        let Some(artifact) = item.artifact.take() else {
            return Err(Error::Other(format!("acquired item has no artifact: {}", url)));
        };

        if let Err(job) = lane.submit(AnalysisJob {
            url: url.clone(),
            artifact,
        }) {
            // Put the artifact back so the abort path can release it
            item.artifact = Some(job.artifact);
            return Err(Error::Other("analysis lane stopped unexpectedly".into()));
        }
        item.transition(ItemStatus::Analyzing);
        self.analyzing = Some(url.clone());
        tracing::debug!(url = %url, "submitted to analysis lane");
        self.emit(Event::AnalyzeStarted { url });
        Ok(())
    }

    async fn admit(&mut self) -> Result<()> {
        let batch_size = self.config.pipeline.batch_size;
        let concurrency = self.config.pipeline.acquire_concurrency;
        let reuse = self.config.pipeline.reuse_existing_artifacts || !self.stages.acquires();

        while self.halt.is_none() && self.window.len() < batch_size {
            if self.stop.is_cancelled() {
                self.halt = Some(Halt::Stopped);
                break;
            }
            let Some(front) = self.pending.front() else {
                break;
            };
            let path = media::artifact_path(&self.config.paths.artifact_dir, &front.url);
            if self.is_claimed(&path) {
                // Another URL for the same media is in the window; wait for it to retire
                tracing::debug!(url = %front.url, path = %path.display(), "artifact path in use, holding back");
                break;
            }

            let existing = if reuse {
                MediaArtifact::locate(&front.url, &path).await
            } else {
                None
            };

            if let Some(artifact) = existing {
                let Some(mut item) = self.pending.pop_front() else {
                    break;
                };
                self.summary.reused += 1;
                if self.stages == StageSelection::AcquireOnly {
                    tracing::debug!(url = %item.url, "artifact already on disk");
                    artifact.retain();
                    continue;
                }
                item.transition(ItemStatus::Acquired);
                item.artifact = Some(artifact);
                let url = item.url.clone();
                self.enter_window(item, path);
                self.ready.push_back(url.clone());
                self.emit(Event::Acquired { url, reused: true });
                continue;
            }

            if !self.stages.acquires() {
                let Some(item) = self.pending.pop_front() else {
                    break;
                };
                tracing::warn!(url = %item.url, path = %path.display(), "no artifact to analyze, skipping");
                self.summary.missing_artifacts += 1;
                self.summary.unfinished += 1;
                continue;
            }

            if self.acquiring >= concurrency {
                break;
            }
            if !self.has_space()? {
                break;
            }

            let Some(acquirer) = self.acquirer.as_ref().map(Arc::clone) else {
                return Err(Error::NotSupported("no acquirer configured".into()));
            };
            let Some(mut item) = self.pending.pop_front() else {
                break;
            };
            item.transition(ItemStatus::Acquiring);
            let request = AcquireRequest {
                url: item.url.clone(),
                platform: item.platform,
                destination: path.clone(),
            };
            let url = item.url.clone();
            self.acquiring += 1;
            self.enter_window(item, path);
            self.emit(Event::AcquireStarted { url });
            spawn_acquisition(
                acquirer,
                self.acquire_policy.clone(),
                request,
                self.reports_tx.clone(),
            );
        }
        Ok(())
    }

    /// Disk check before a new acquisition
    ///
    /// `Ok(false)` pauses admission until something in the window retires; with an
    /// empty window there is nothing left to reclaim and the run fails.
    fn has_space(&mut self) -> Result<bool> {
        let disk = &self.config.disk_space;
        if !disk.enabled {
            return Ok(true);
        }
        match media::check_free_space(&self.config.paths.artifact_dir, disk.min_free_space) {
            Ok(()) => {
                if self.space_blocked {
                    tracing::info!("disk space available again, resuming admission");
                    self.space_blocked = false;
                }
                Ok(true)
            }
            Err(Error::InsufficientSpace {
                required,
                available,
            }) => {
                if self.window.is_empty() {
                    tracing::error!(required, available, "disk full and nothing left to reclaim");
                    return Err(Error::InsufficientSpace {
                        required,
                        available,
                    });
                }
                if !self.space_blocked {
                    tracing::warn!(
                        required,
                        available,
                        in_window = self.window.len(),
                        "low disk space, pausing admission until items retire"
                    );
                    self.space_blocked = true;
                }
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "disk space check failed, continuing");
                Ok(true)
            }
        }
    }

    fn is_claimed(&self, path: &Path) -> bool {
        self.destinations.values().any(|claimed| claimed == path)
    }

    fn enter_window(&mut self, item: WorkItem, destination: PathBuf) {
        let url = item.url.clone();
        self.destinations.insert(url.clone(), destination);
        self.window.insert(url.clone(), item);
        self.summary.admitted += 1;
        debug_assert!(self.window.len() <= self.config.pipeline.batch_size);
        tracing::debug!(url = %url, in_window = self.window.len(), "admitted");
        self.emit(Event::Admitted {
            url,
            in_window: self.window.len(),
        });
    }

    fn retire(&mut self, url: &str) -> Option<WorkItem> {
        let item = self.window.remove(url)?;
        self.destinations.remove(url);
        match item.status {
            ItemStatus::Pending => self.summary.unfinished += 1,
            ItemStatus::Failed => self.summary.failed += 1,
            ItemStatus::Analyzed => self.summary.analyzed += 1,
            _ => {}
        }
        self.emit(Event::Retired {
            url: url.to_string(),
            status: item.status,
            in_window: self.window.len(),
        });
        Some(item)
    }

    /// Reclaim or retain an artifact whose item no longer needs it
    async fn release_artifact(&mut self, artifact: MediaArtifact) {
        if self.config.keeps_artifacts() {
            let path = artifact.retain();
            tracing::debug!(path = %path.display(), "artifact retained");
            return;
        }
        let url = artifact.url().to_string();
        let path = artifact.path().to_path_buf();
        match artifact.reclaim().await {
            Ok(()) => self.emit(Event::Reclaimed { url }),
            Err(e) => {
                self.summary.reclaim_failures += 1;
                tracing::warn!(url = %url, path = %path.display(), error = %e, "failed to reclaim artifact");
            }
        }
    }

    async fn on_acquired(&mut self, report: AcquireReport) -> Result<()> {
        self.acquiring = self.acquiring.saturating_sub(1);
        let AcquireReport {
            url,
            result,
            attempts,
        } = report;

        let Some(item) = self.window.get_mut(&url) else {
            tracing::error!(url = %url, "acquisition report for unknown item");
            if let Ok(artifact) = result {
                self.release_artifact(artifact).await;
            }
            return Ok(());
        };
        item.acquire_attempts = attempts;

        match result {
            Ok(artifact) => {
                self.summary.acquired += 1;
                tracing::info!(url = %url, attempts, bytes = artifact.size(), "acquired");
                let acquired = Event::Acquired {
                    url: url.clone(),
                    reused: false,
                };

                if self.halt == Some(Halt::SessionExpired) {
                    item.transition(ItemStatus::Pending);
                    self.emit(acquired);
                    self.release_artifact(artifact).await;
                    self.retire(&url);
                } else if self.stages == StageSelection::AcquireOnly {
                    item.transition(ItemStatus::Acquired);
                    let path = artifact.retain();
                    tracing::debug!(url = %url, path = %path.display(), "artifact kept for a later analysis run");
                    self.emit(acquired);
                    self.retire(&url);
                } else {
                    item.transition(ItemStatus::Acquired);
                    item.artifact = Some(artifact);
                    self.ready.push_back(url);
                    self.emit(acquired);
                }
            }
            Err(e) => {
                item.transition(ItemStatus::Failed);
                let reason = format!("acquire: {}", e);
                tracing::error!(url = %url, attempts, error = %e, "acquisition failed permanently");
                self.ledger.mark_failed(&url, &reason).await?;
                self.emit(Event::ItemFailed {
                    url: url.clone(),
                    stage: "acquire".into(),
                    reason,
                });
                self.retire(&url);
            }
        }
        Ok(())
    }

    async fn on_analyzed(&mut self, report: AnalyzeReport) -> Result<()> {
        self.analyzing = None;
        let AnalyzeReport {
            url,
            artifact,
            result,
            attempts,
        } = report;

        let Some(item) = self.window.get_mut(&url) else {
            tracing::error!(url = %url, "analysis report for unknown item");
            self.release_artifact(artifact).await;
            return Ok(());
        };
        item.analyze_attempts = attempts;

        match result {
            Ok(result) => {
                let Some(sink) = self.sink.as_mut() else {
                    return Err(Error::Other("analysis finished without a result store".into()));
                };
                let result_ref = sink.append(&url, &result)?;
                self.ledger.mark_done(&url, Some(&result_ref)).await?;
                item.transition(ItemStatus::Analyzed);
                tracing::info!(url = %url, attempts, result_ref = %result_ref, "analyzed");
                self.emit(Event::Analyzed {
                    url: url.clone(),
                    result_ref,
                });
                self.release_artifact(artifact).await;
                self.retire(&url);
            }
            Err(e) if e.is_session_expired() => {
                item.transition(ItemStatus::Pending);
                tracing::error!(
                    url = %url,
                    error = %e,
                    "analysis session expired, no further analysis this run"
                );
                self.halt = Some(Halt::SessionExpired);
                self.emit(Event::SessionExpired { url: url.clone() });
                self.release_artifact(artifact).await;
                self.retire(&url);
                self.release_ready().await;
            }
            Err(e) => {
                item.transition(ItemStatus::Failed);
                let reason = format!("analyze: {}", e);
                tracing::error!(url = %url, attempts, error = %e, "analysis failed permanently");
                self.ledger.mark_failed(&url, &reason).await?;
                self.emit(Event::ItemFailed {
                    url: url.clone(),
                    stage: "analyze".into(),
                    reason,
                });
                self.release_artifact(artifact).await;
                self.retire(&url);
            }
        }
        Ok(())
    }

    /// Send every acquired-but-unanalyzed item back to pending
    async fn release_ready(&mut self) {
        while let Some(url) = self.ready.pop_front() {
            let artifact = match self.window.get_mut(&url) {
                Some(item) => {
                    item.transition(ItemStatus::Pending);
                    item.artifact.take()
                }
                None => None,
            };
            if let Some(artifact) = artifact {
                self.release_artifact(artifact).await;
            }
            self.retire(&url);
        }
    }

    async fn finish(mut self) -> Result<RunSummary> {
        if let Some(lane) = self.lane.take() {
            lane.shutdown().await;
        }

        let outcome = match self.halt {
            None => RunOutcome::Completed,
            Some(Halt::Stopped) => RunOutcome::Stopped,
            Some(Halt::SessionExpired) => RunOutcome::SessionExpired,
        };
        self.summary.unfinished += self.pending.len();
        self.summary.outcome = Some(outcome);
        self.summary.duration = self.started.elapsed();

        self.ledger
            .finish_run(
                outcome.as_str(),
                self.summary.analyzed as u64,
                self.summary.failed as u64,
            )
            .await?;
        self.ledger.checkpoint().await?;

        tracing::info!(
            outcome = outcome.as_str(),
            analyzed = self.summary.analyzed,
            failed = self.summary.failed,
            acquired = self.summary.acquired,
            reused = self.summary.reused,
            unfinished = self.summary.unfinished,
            skipped_done = self.summary.skipped_done,
            missing_artifacts = self.summary.missing_artifacts,
            reclaim_failures = self.summary.reclaim_failures,
            duration_secs = self.summary.duration.as_secs(),
            "run finished"
        );
        self.emit(Event::RunFinished {
            summary: self.summary.clone(),
        });
        Ok(self.summary)
    }

    /// Best-effort cleanup after a systemic failure
    ///
    /// Artifacts the coordinator holds are released; in-flight acquisitions are left to
    /// finish on their own and their files are picked up or swept by the next run.
    async fn abort(&mut self, error: &Error) {
        tracing::error!(error = %error, "run aborted");
        self.halt = Some(Halt::Stopped);

        let held: Vec<MediaArtifact> = self
            .window
            .values_mut()
            .filter_map(|item| item.artifact.take())
            .collect();
        for artifact in held {
            self.release_artifact(artifact).await;
        }
        if let Some(lane) = self.lane.take() {
            lane.shutdown().await;
        }
        if let Err(e) = self
            .ledger
            .record_run_outcome(
                "fatal",
                self.summary.analyzed as u64,
                self.summary.failed as u64,
            )
            .await
        {
            tracing::warn!(error = %e, "could not record aborted run");
        }
    }
}

/// Mark rows already in the result store as done when the ledger missed them
///
/// This closes the gap between a sink append and the ledger write that follows it.
async fn reconcile(ledger: &Ledger, output: &std::path::Path) -> Result<()> {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut reconciled = 0usize;
    for url in sink::recorded_urls(output)? {
        if !ledger.is_done(&url).await? {
            ledger.mark_done(&url, Some(&name)).await?;
            reconciled += 1;
        }
    }
    if reconciled > 0 {
        tracing::warn!(reconciled, "marked results already in the store as done");
    }
    Ok(())
}
