//! The analysis lane: one task, one analyzer, one job at a time.

use super::coordinator::Report;
use crate::collaborators::{Analyzer, PromptConfig, StructuredResult};
use crate::error::{AnalyzeError, AnalyzeErrorKind};
use crate::media::MediaArtifact;
use crate::retry::RetryPolicy;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Work handed to the lane; the artifact travels with it and comes back in the report
pub(super) struct AnalysisJob {
    pub url: String,
    pub artifact: MediaArtifact,
}

/// Final outcome of one job, retries included
pub(super) struct AnalyzeReport {
    pub url: String,
    pub artifact: MediaArtifact,
    pub result: Result<StructuredResult, AnalyzeError>,
    pub attempts: u32,
}

/// Handle to the running lane
pub(super) struct AnalysisLane {
    jobs: mpsc::Sender<AnalysisJob>,
    handle: JoinHandle<()>,
}

impl AnalysisLane {
    /// Move `analyzer` into a new lane task
    pub fn spawn(
        analyzer: Box<dyn Analyzer>,
        policy: RetryPolicy,
        prompt: PromptConfig,
        columns: Vec<String>,
        reports: mpsc::UnboundedSender<Report>,
    ) -> Self {
        // Capacity 1: the coordinator only submits while the lane is idle
        let (jobs, rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_lane(analyzer, rx, reports, policy, prompt, columns));
        Self { jobs, handle }
    }

    /// Hand a job to the lane, giving it back if the lane cannot take it
    pub fn submit(&self, job: AnalysisJob) -> Result<(), AnalysisJob> {
        self.jobs.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    /// Close the job queue and wait for the lane to finish its current job
    pub async fn shutdown(self) {
        drop(self.jobs);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "analysis lane terminated abnormally");
        }
    }
}

async fn run_lane(
    mut analyzer: Box<dyn Analyzer>,
    mut jobs: mpsc::Receiver<AnalysisJob>,
    reports: mpsc::UnboundedSender<Report>,
    policy: RetryPolicy,
    prompt: PromptConfig,
    columns: Vec<String>,
) {
    tracing::debug!(analyzer = analyzer.name(), "analysis lane started");

    while let Some(job) = jobs.recv().await {
        let (result, attempts) =
            analyze_with_retry(analyzer.as_mut(), &job, &policy, &prompt, &columns).await;

        let report = AnalyzeReport {
            url: job.url,
            artifact: job.artifact,
            result,
            attempts,
        };
        if reports.send(Report::Analyzed(report)).is_err() {
            tracing::debug!("coordinator gone, stopping analysis lane");
            break;
        }
    }

    tracing::debug!("analysis lane stopped");
}

/// Analyze one job, retrying transient failures and blank results
async fn analyze_with_retry(
    analyzer: &mut dyn Analyzer,
    job: &AnalysisJob,
    policy: &RetryPolicy,
    prompt: &PromptConfig,
    columns: &[String],
) -> (Result<StructuredResult, AnalyzeError>, u32) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match analyzer.analyze(&job.artifact, &job.url, prompt).await {
            Ok(result) if result.is_blank(columns) => Err(AnalyzeError::new(
                AnalyzeErrorKind::EmptyResponse,
                "no value for any result column",
            )),
            other => other,
        };

        let err = match outcome {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(url = %job.url, attempts = attempt, "analysis succeeded after retry");
                }
                return (Ok(result), attempt);
            }
            Err(err) => err,
        };

        match policy.next_delay(attempt, &err) {
            Some(delay) => {
                tracing::warn!(
                    url = %job.url,
                    error = %err,
                    attempt,
                    max_retries = policy.max_retries(),
                    delay_ms = delay.as_millis(),
                    "analysis failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            None => return (Err(err), attempt),
        }
    }
}
