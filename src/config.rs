//! Configuration types for reelbatch

use crate::collaborators::PromptConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File locations used by a run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Input list, a CSV file with a `url` column (default: "data.csv")
    #[serde(default = "default_input_file")]
    pub input_file: PathBuf,

    /// Directory holding acquired media artifacts (default: "downloads")
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Ledger database path (default: "reelbatch.db")
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Result store, an append-only CSV file (default: "output.csv")
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_file: default_input_file(),
            artifact_dir: default_artifact_dir(),
            ledger_path: default_ledger_path(),
            output_file: default_output_file(),
        }
    }
}

/// Windowing and stage selection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of items between admission and retirement (default: 4)
    ///
    /// Each in-window item holds at most one artifact, so this also bounds disk usage.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum number of concurrent acquisitions (default: 2, must not exceed `batch_size`)
    #[serde(default = "default_acquire_concurrency")]
    pub acquire_concurrency: usize,

    /// Keep artifacts on disk after analysis instead of deleting them
    #[serde(default)]
    pub retain_artifacts: bool,

    /// Only run the acquisition stage; artifacts are kept for a later analysis run
    #[serde(default)]
    pub download_only: bool,

    /// Only run the analysis stage, on artifacts already present in `artifact_dir`
    #[serde(default)]
    pub analyze_only: bool,

    /// Treat a non-empty artifact already on disk as acquired (default: true)
    #[serde(default = "default_true")]
    pub reuse_existing_artifacts: bool,

    /// Re-admit URLs that failed permanently in an earlier run (default: true)
    #[serde(default = "default_true")]
    pub retry_failed: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            acquire_concurrency: default_acquire_concurrency(),
            retain_artifacts: false,
            download_only: false,
            analyze_only: false,
            reuse_existing_artifacts: true,
            retry_failed: true,
        }
    }
}

/// Which stages a run executes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageSelection {
    /// Acquire, analyze, record
    Full,
    /// Acquire and keep artifacts
    AcquireOnly,
    /// Analyze artifacts already on disk
    AnalyzeOnly,
}

impl StageSelection {
    /// Whether the acquisition stage runs
    pub fn acquires(&self) -> bool {
        !matches!(self, StageSelection::AnalyzeOnly)
    }

    /// Whether the analysis stage runs
    pub fn analyzes(&self) -> bool {
        !matches!(self, StageSelection::AcquireOnly)
    }
}

/// Delay growth between retry attempts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay multiplied by `backoff_multiplier` after every retry, capped at `max_delay`
    Exponential,
}

/// Retry configuration for one stage
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay growth policy (default: fixed)
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Delay before the first retry (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Upper bound on any single delay (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffPolicy::Fixed,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Disk space checking configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskSpaceConfig {
    /// Enable disk space checking before each acquisition (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum free space to keep in the artifact directory (default: 1 GB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_free_space: default_min_free_space(),
        }
    }
}

/// External programs backing the command collaborators
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// Acquisition program (looked up in PATH when relative)
    #[serde(default)]
    pub acquire_command: Option<PathBuf>,

    /// Extra arguments placed before the URL and destination
    #[serde(default)]
    pub acquire_args: Vec<String>,

    /// Analysis program (looked up in PATH when relative)
    #[serde(default)]
    pub analyze_command: Option<PathBuf>,

    /// Extra arguments placed before the artifact path and URL
    #[serde(default)]
    pub analyze_args: Vec<String>,

    /// Time limit for a single collaborator call (default: 120 seconds)
    #[serde(default = "default_call_timeout", with = "duration_serde")]
    pub call_timeout: Duration,

    /// Opaque session credential consumed by the analyzer
    #[serde(default)]
    pub session_file: Option<PathBuf>,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            acquire_command: None,
            acquire_args: vec![],
            analyze_command: None,
            analyze_args: vec![],
            call_timeout: default_call_timeout(),
            session_file: None,
        }
    }
}

/// Main configuration for a reelbatch run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// File locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Windowing and stage selection
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry policy for acquisition
    #[serde(default)]
    pub acquire_retry: RetryConfig,

    /// Retry policy for analysis
    #[serde(default)]
    pub analyze_retry: RetryConfig,

    /// Disk space checking
    #[serde(default)]
    pub disk_space: DiskSpaceConfig,

    /// Prompt and session options handed to the analyzer unchanged
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Collaborator-defined result columns, written after `url` (default: ["message"])
    #[serde(default = "default_result_columns")]
    pub result_columns: Vec<String>,

    /// External collaborator programs
    #[serde(default)]
    pub collaborators: CollaboratorConfig,

    /// Optional log file for the binary
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            pipeline: PipelineConfig::default(),
            acquire_retry: RetryConfig::default(),
            analyze_retry: RetryConfig::default(),
            disk_space: DiskSpaceConfig::default(),
            prompt: PromptConfig::default(),
            result_columns: default_result_columns(),
            collaborators: CollaboratorConfig::default(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    ///
    /// Missing fields take their defaults. The result is validated before it is returned.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read '{}': {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse '{}': {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        if pipeline.batch_size == 0 {
            return Err(Error::config(
                "pipeline.batch_size",
                "batch_size must be at least 1",
            ));
        }
        if pipeline.acquire_concurrency == 0 || pipeline.acquire_concurrency > pipeline.batch_size
        {
            return Err(Error::config(
                "pipeline.acquire_concurrency",
                format!(
                    "acquire_concurrency must be between 1 and batch_size ({}), got {}",
                    pipeline.batch_size, pipeline.acquire_concurrency
                ),
            ));
        }
        if pipeline.download_only && pipeline.analyze_only {
            return Err(Error::config(
                "pipeline.download_only",
                "download_only and analyze_only cannot both be set",
            ));
        }
        for (key, retry) in [
            ("acquire_retry", &self.acquire_retry),
            ("analyze_retry", &self.analyze_retry),
        ] {
            if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0) {
                return Err(Error::config(
                    format!("{key}.backoff_multiplier"),
                    "backoff_multiplier must be a finite number >= 1.0",
                ));
            }
            if retry.max_delay < retry.initial_delay {
                return Err(Error::config(
                    format!("{key}.max_delay"),
                    "max_delay must not be shorter than initial_delay",
                ));
            }
        }
        if self.result_columns.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::config(
                "result_columns",
                "result column names must not be empty",
            ));
        }
        if self.result_columns.iter().any(|c| c == "url") {
            return Err(Error::config(
                "result_columns",
                "`url` is always the first column and cannot be redefined",
            ));
        }
        Ok(())
    }

    /// Stages selected by `download_only` / `analyze_only`
    pub fn stages(&self) -> StageSelection {
        if self.pipeline.download_only {
            StageSelection::AcquireOnly
        } else if self.pipeline.analyze_only {
            StageSelection::AnalyzeOnly
        } else {
            StageSelection::Full
        }
    }

    /// Whether artifacts survive past their item's retirement
    ///
    /// Acquire-only runs always keep artifacts, since a later run analyzes them.
    pub fn keeps_artifacts(&self) -> bool {
        self.pipeline.retain_artifacts || self.pipeline.download_only
    }
}

// Default value functions
fn default_input_file() -> PathBuf {
    PathBuf::from("data.csv")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("reelbatch.db")
}

fn default_output_file() -> PathBuf {
    PathBuf::from("output.csv")
}

fn default_batch_size() -> usize {
    4
}

fn default_acquire_concurrency() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_min_free_space() -> u64 {
    1024 * 1024 * 1024 // 1 GB
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_result_columns() -> Vec<String> {
    vec!["message".into()]
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
