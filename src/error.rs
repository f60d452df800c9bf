//! Error types for reelbatch
//!
//! This module separates three kinds of failure:
//! - [`Error`]: failures of the pipeline itself (configuration, ledger, result store, disk)
//! - [`AcquireError`]: a single acquisition attempt failed
//! - [`AnalyzeError`]: a single analysis attempt failed
//!
//! Per-item collaborator errors never leave the scheduler. Only [`Error`] values
//! reach the caller of [`BatchScheduler::run`](crate::scheduler::BatchScheduler::run),
//! and [`Error::exit_code`] maps them onto the process exit status.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for reelbatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes used by the binary
pub mod exit_code {
    /// All pending items retired, or the run was stopped gracefully
    pub const SUCCESS: i32 = 0;
    /// Startup failure (bad configuration, missing input, missing session artifact)
    pub const STARTUP: i32 = 1;
    /// Fatal resource failure (ledger or result store unusable, disk exhausted)
    pub const FATAL_RESOURCE: i32 = 2;
    /// The analysis session expired and must be refreshed out-of-band
    pub const SESSION_EXPIRED: i32 = 3;
    /// A second termination signal abandoned in-flight items
    pub const INTERRUPTED: i32 = 130;
}

/// Main error type for reelbatch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "pipeline.batch_size")
        key: Option<String>,
    },

    /// Ledger operation failed
    #[error("ledger error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("ledger error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reading or writing CSV (input list or result store) failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The input list could not be used
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Result store could not be written
    #[error("result store error at {path}: {reason}")]
    ResultStore {
        /// Path of the result store
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Not enough free space left for another artifact, even after reclamation
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes that must remain free
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Failed to check disk space
    #[error("failed to check disk space: {0}")]
    DiskSpaceCheckFailed(String),

    /// The analysis session credential is missing or unusable at startup
    #[error("analysis session unavailable: {0}")]
    SessionUnavailable(String),

    /// External tool execution failed
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, disabled stage, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A second termination signal arrived before in-flight items finished
    #[error("interrupted before in-flight items finished")]
    Interrupted,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Whether this error means shared storage (ledger, result store, disk) is unusable
    ///
    /// Systemic errors end the whole run; everything else is a startup problem.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Sqlx(_)
                | Error::Io(_)
                | Error::ResultStore { .. }
                | Error::InsufficientSpace { .. }
        )
    }

    /// Process exit code for a run that ended with this error
    pub fn exit_code(&self) -> i32 {
        if matches!(self, Error::Interrupted) {
            exit_code::INTERRUPTED
        } else if self.is_systemic() {
            exit_code::FATAL_RESOURCE
        } else {
            exit_code::STARTUP
        }
    }
}

/// Ledger-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to open the ledger
    #[error("failed to open ledger: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Write could not be made durable
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Classification of a failed acquisition attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireErrorKind {
    /// The source reported the content as missing
    NotFound,
    /// The source is throttling requests
    RateLimited,
    /// Connection reset, timeout, or other transient network trouble
    TransientNetwork,
    /// The URL can never be acquired (unsupported platform, private content, ...)
    PermanentUnsupported,
}

impl std::fmt::Display for AcquireErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AcquireErrorKind::NotFound => "not found",
            AcquireErrorKind::RateLimited => "rate limited",
            AcquireErrorKind::TransientNetwork => "transient network failure",
            AcquireErrorKind::PermanentUnsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// A failed acquisition attempt
#[derive(Debug, Clone, Error)]
#[error("acquisition failed ({kind}): {message}")]
pub struct AcquireError {
    /// Failure classification
    pub kind: AcquireErrorKind,
    /// Detail from the acquirer
    pub message: String,
}

impl AcquireError {
    /// Create a new acquisition error
    pub fn new(kind: AcquireErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Classification of a failed analysis attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalyzeErrorKind {
    /// The shared session is no longer authenticated
    SessionExpired,
    /// The analysis backend is throttling submissions
    RateLimited,
    /// No answer arrived in time
    Timeout,
    /// The backend refused this content
    PermanentRejected,
    /// An answer arrived but carried no usable values
    EmptyResponse,
}

impl std::fmt::Display for AnalyzeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnalyzeErrorKind::SessionExpired => "session expired",
            AnalyzeErrorKind::RateLimited => "rate limited",
            AnalyzeErrorKind::Timeout => "timeout",
            AnalyzeErrorKind::PermanentRejected => "rejected",
            AnalyzeErrorKind::EmptyResponse => "empty response",
        };
        f.write_str(s)
    }
}

/// A failed analysis attempt
#[derive(Debug, Clone, Error)]
#[error("analysis failed ({kind}): {message}")]
pub struct AnalyzeError {
    /// Failure classification
    pub kind: AnalyzeErrorKind,
    /// Detail from the analyzer
    pub message: String,
}

impl AnalyzeError {
    /// Create a new analysis error
    pub fn new(kind: AnalyzeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether this failure means no further analysis can succeed this run
    pub fn is_session_expired(&self) -> bool {
        self.kind == AnalyzeErrorKind::SessionExpired
    }
}
