//! Test configuration helpers: isolated directories, fast retries, ledger setup

use reelbatch::config::RetryConfig;
use reelbatch::{Config, Ledger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// One isolated working directory per test
pub struct TestEnv {
    /// Owns the directory; dropping it removes everything
    pub dir: TempDir,
    /// Run configuration pointing into `dir`
    pub config: Config,
}

impl TestEnv {
    /// Fresh environment with the given window and acquisition concurrency
    pub fn new(batch_size: usize, acquire_concurrency: usize) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = Config::default();
        config.paths.artifact_dir = dir.path().join("downloads");
        config.paths.output_file = dir.path().join("output.csv");
        config.paths.ledger_path = dir.path().join("reelbatch.db");
        config.paths.input_file = dir.path().join("data.csv");
        config.pipeline.batch_size = batch_size;
        config.pipeline.acquire_concurrency = acquire_concurrency;
        config.acquire_retry = fast_retry(3);
        config.analyze_retry = fast_retry(3);
        config.disk_space.enabled = false;
        config.result_columns = vec!["message".to_string()];
        Self { dir, config }
    }

    /// Open (or reopen) the ledger at the configured path
    pub async fn ledger(&self) -> Arc<Ledger> {
        Arc::new(
            Ledger::open(&self.config.paths.ledger_path)
                .await
                .expect("open ledger"),
        )
    }

    /// Artifact directory
    pub fn artifact_dir(&self) -> PathBuf {
        self.config.paths.artifact_dir.clone()
    }

    /// Output file
    pub fn output_file(&self) -> PathBuf {
        self.config.paths.output_file.clone()
    }
}

/// Retry policy with millisecond delays
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

/// `n` distinct TikTok-style URLs
pub fn tiktok_urls(n: usize) -> Vec<String> {
    (1..=n)
        .map(|i| format!("https://www.tiktok.com/@creator/video/7{:018}", i))
        .collect()
}
