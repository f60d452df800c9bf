//! Acquisition and analysis collaborators
//!
//! The scheduler only sees two narrow seams:
//!
//! - [`Acquirer`]: given a URL and a destination, produce a [`MediaArtifact`]
//! - [`Analyzer`]: given an artifact, its URL and the prompt, produce a [`StructuredResult`]
//!
//! An `Acquirer` is shared by every acquisition worker and must be `Sync`. An
//! `Analyzer` wraps one authenticated remote session; it is moved into the single
//! analysis lane and borrowed mutably, so it never needs internal locking.
//!
//! [`CommandAcquirer`] and [`CommandAnalyzer`] are the stock implementations, driving
//! external programs.

pub mod command;

pub use command::{CommandAcquirer, CommandAnalyzer};

use crate::error::{AcquireError, AnalyzeError};
use crate::media::{MediaArtifact, SourcePlatform};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const DEFAULT_PROMPT: &str = "Please analyze the video based on the following metrics and \
provide the results in a table format with two columns: 'Metrics' and 'Value'.";

/// Prompt and session options, passed to the analyzer unchanged
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Prompt submitted alongside each artifact
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// Run the analysis session without a visible UI
    #[serde(default)]
    pub headless: bool,

    /// Free-form options for the analyzer
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            headless: false,
            options: BTreeMap::new(),
        }
    }
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

/// What the scheduler asks an acquirer to fetch
#[derive(Clone, Debug)]
pub struct AcquireRequest {
    /// Source URL
    pub url: String,
    /// Platform derived from the URL
    pub platform: SourcePlatform,
    /// Where the artifact must be written
    pub destination: PathBuf,
}

/// Collaborator-defined analysis output, keyed by column name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredResult {
    fields: BTreeMap<String, String>,
}

impl StructuredResult {
    /// Empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion
    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(column, value);
        self
    }

    /// Set a field, collapsing runs of whitespace in the value
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(column.into(), clean_value(&value.into()));
    }

    /// Value of a field, if present
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// All fields in column order
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// True when no column in `columns` carries a real value
    ///
    /// A value that only repeats its own column name counts as missing: it is what a
    /// half-rendered answer table looks like.
    pub fn is_blank(&self, columns: &[String]) -> bool {
        columns.iter().all(|column| match self.get(column) {
            None => true,
            Some(value) => value.is_empty() || value.eq_ignore_ascii_case(column),
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StructuredResult {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut result = StructuredResult::new();
        for (k, v) in iter {
            result.insert(k, v);
        }
        result
    }
}

fn clean_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Retrieves the media behind a URL
#[async_trait]
pub trait Acquirer: Send + Sync {
    /// Fetch `request.url` into `request.destination`
    async fn acquire(&self, request: &AcquireRequest) -> Result<MediaArtifact, AcquireError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Submits artifacts to the remote analysis session
#[async_trait]
pub trait Analyzer: Send {
    /// Analyze one artifact. Never called concurrently.
    async fn analyze(
        &mut self,
        artifact: &MediaArtifact,
        url: &str,
        prompt: &PromptConfig,
    ) -> Result<StructuredResult, AnalyzeError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}
