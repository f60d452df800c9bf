//! Acquisition workers.

use super::coordinator::Report;
use crate::collaborators::{AcquireRequest, Acquirer};
use crate::error::AcquireError;
use crate::media::{MediaArtifact, remove_partial};
use crate::retry::{RetryPolicy, run_with_retry};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

/// Final outcome of one item's acquisition, retries included
pub(super) struct AcquireReport {
    pub url: String,
    pub result: Result<MediaArtifact, AcquireError>,
    pub attempts: u32,
}

/// Spawn a worker that acquires `request` with retries and reports once
///
/// Each failed attempt removes whatever partial file it left behind.
pub(super) fn spawn_acquisition(
    acquirer: Arc<dyn Acquirer>,
    policy: RetryPolicy,
    request: AcquireRequest,
    reports: mpsc::UnboundedSender<Report>,
) {
    tokio::spawn(async move {
        let attempts = Arc::new(AtomicU32::new(0));
        let url = request.url.clone();

        let result = run_with_retry(&policy, || {
            let acquirer = Arc::clone(&acquirer);
            let request = request.clone();
            let attempts = Arc::clone(&attempts);
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(url = %request.url, attempt, acquirer = acquirer.name(), "acquiring");
                let result = acquirer.acquire(&request).await;
                if result.is_err() {
                    remove_partial(&request.destination).await;
                }
                result
            }
        })
        .await;

        let report = AcquireReport {
            url,
            result,
            attempts: attempts.load(Ordering::SeqCst),
        };
        if reports.send(Report::Acquired(report)).is_err() {
            tracing::debug!("coordinator gone, dropping acquisition report");
        }
    });
}
