//! Collaborators backed by external programs
//!
//! Both implementations spawn a configured binary per call with `tokio::process::Command`,
//! bound the call with a timeout, and translate the exit status into a typed error kind.
//!
//! | Program  | Exit code | Meaning |
//! |----------|-----------|---------|
//! | acquirer | 0  | artifact written to the destination |
//! | acquirer | 10 | [`AcquireErrorKind::NotFound`] |
//! | acquirer | 11 | [`AcquireErrorKind::RateLimited`] |
//! | acquirer | 13 | [`AcquireErrorKind::PermanentUnsupported`] |
//! | analyzer | 0  | stdout holds a JSON object of column to value |
//! | analyzer | 20 | [`AnalyzeErrorKind::SessionExpired`] |
//! | analyzer | 21 | [`AnalyzeErrorKind::RateLimited`] |
//! | analyzer | 23 | [`AnalyzeErrorKind::PermanentRejected`] |
//!
//! Any other non-zero status, a kill by signal, or a timeout is reported as
//! `TransientNetwork` for the acquirer and `Timeout` for the analyzer.

use super::{AcquireRequest, Acquirer, Analyzer, PromptConfig, StructuredResult};
use crate::config::CollaboratorConfig;
use crate::error::{AcquireError, AcquireErrorKind, AnalyzeError, AnalyzeErrorKind, Error, Result};
use crate::media::MediaArtifact;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Environment variable carrying the prompt text to the analyzer program
pub const PROMPT_ENV: &str = "REELBATCH_PROMPT";
/// Environment variable set to `1` when the analysis session should run headless
pub const HEADLESS_ENV: &str = "REELBATCH_HEADLESS";
/// Environment variable carrying the session credential path
pub const SESSION_FILE_ENV: &str = "REELBATCH_SESSION_FILE";
/// Prefix for free-form prompt options (`REELBATCH_OPT_<KEY>`)
pub const OPTION_ENV_PREFIX: &str = "REELBATCH_OPT_";

/// Outcome of one bounded program run
enum Invocation {
    Finished(Output),
    TimedOut,
}

async fn invoke(mut command: Command, timeout: Duration) -> std::io::Result<Invocation> {
    command.kill_on_drop(true);
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => Ok(Invocation::Finished(output?)),
        Err(_) => Ok(Invocation::TimedOut),
    }
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(399)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

fn resolve_program(configured: &Path) -> Result<PathBuf> {
    which::which(configured).map_err(|e| {
        Error::NotSupported(format!(
            "collaborator program {} not found: {}",
            configured.display(),
            e
        ))
    })
}

/// Acquirer that runs `<program> [args...] <url> <destination>`
pub struct CommandAcquirer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAcquirer {
    /// Create an acquirer with an explicit program path
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    /// Build from configuration, resolving the program through `PATH`
    ///
    /// Returns `Error::Config` when no acquire command is configured.
    pub fn from_config(config: &CollaboratorConfig) -> Result<Self> {
        let configured = config.acquire_command.as_ref().ok_or_else(|| {
            Error::config("collaborators.acquire_command", "no acquire command configured")
        })?;
        Ok(Self::new(
            resolve_program(configured)?,
            config.acquire_args.clone(),
            config.call_timeout,
        ))
    }

    fn classify(code: Option<i32>) -> AcquireErrorKind {
        match code {
            Some(10) => AcquireErrorKind::NotFound,
            Some(11) => AcquireErrorKind::RateLimited,
            Some(13) => AcquireErrorKind::PermanentUnsupported,
            _ => AcquireErrorKind::TransientNetwork,
        }
    }
}

#[async_trait]
impl Acquirer for CommandAcquirer {
    async fn acquire(
        &self,
        request: &AcquireRequest,
    ) -> std::result::Result<MediaArtifact, AcquireError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&request.url)
            .arg(&request.destination);

        let output = match invoke(command, self.timeout).await {
            Ok(Invocation::Finished(output)) => output,
            Ok(Invocation::TimedOut) => {
                return Err(AcquireError::new(
                    AcquireErrorKind::TransientNetwork,
                    format!("acquirer timed out after {}s", self.timeout.as_secs()),
                ));
            }
            Err(e) => {
                return Err(AcquireError::new(
                    AcquireErrorKind::TransientNetwork,
                    format!("failed to execute {}: {}", self.program.display(), e),
                ));
            }
        };

        if !output.status.success() {
            return Err(AcquireError::new(
                Self::classify(output.status.code()),
                format!("acquirer exited with {}: {}", output.status, stderr_tail(&output)),
            ));
        }

        MediaArtifact::locate(&request.url, &request.destination)
            .await
            .ok_or_else(|| {
                AcquireError::new(
                    AcquireErrorKind::TransientNetwork,
                    format!(
                        "acquirer succeeded but {} is missing or empty",
                        request.destination.display()
                    ),
                )
            })
    }

    fn name(&self) -> &'static str {
        "command-acquirer"
    }
}

/// Analyzer that runs `<program> [args...] <artifact> <url>` against one session
pub struct CommandAnalyzer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    session_file: Option<PathBuf>,
}

impl CommandAnalyzer {
    /// Create an analyzer with an explicit program path
    ///
    /// Fails with `Error::SessionUnavailable` when a session file is given but absent.
    pub fn new(
        program: PathBuf,
        args: Vec<String>,
        timeout: Duration,
        session_file: Option<PathBuf>,
    ) -> Result<Self> {
        if let Some(session) = &session_file {
            if !session.is_file() {
                return Err(Error::SessionUnavailable(format!(
                    "session file {} does not exist",
                    session.display()
                )));
            }
        }
        Ok(Self {
            program,
            args,
            timeout,
            session_file,
        })
    }

    /// Build from configuration, resolving the program through `PATH`
    pub fn from_config(config: &CollaboratorConfig) -> Result<Self> {
        let configured = config.analyze_command.as_ref().ok_or_else(|| {
            Error::config("collaborators.analyze_command", "no analyze command configured")
        })?;
        Self::new(
            resolve_program(configured)?,
            config.analyze_args.clone(),
            config.call_timeout,
            config.session_file.clone(),
        )
    }

    fn classify(code: Option<i32>) -> AnalyzeErrorKind {
        match code {
            Some(20) => AnalyzeErrorKind::SessionExpired,
            Some(21) => AnalyzeErrorKind::RateLimited,
            Some(23) => AnalyzeErrorKind::PermanentRejected,
            _ => AnalyzeErrorKind::Timeout,
        }
    }
}

/// Parse analyzer stdout into a result
///
/// Scalar JSON values are rendered as text; `null` becomes an empty field.
fn parse_analysis(stdout: &[u8]) -> std::result::Result<StructuredResult, AnalyzeError> {
    let value: serde_json::Value = serde_json::from_slice(stdout).map_err(|e| {
        AnalyzeError::new(
            AnalyzeErrorKind::EmptyResponse,
            format!("analyzer output is not JSON: {}", e),
        )
    })?;
    let serde_json::Value::Object(map) = value else {
        return Err(AnalyzeError::new(
            AnalyzeErrorKind::EmptyResponse,
            "analyzer output is not a JSON object",
        ));
    };

    Ok(map
        .into_iter()
        .map(|(column, value)| {
            let text = match value {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (column, text)
        })
        .collect())
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(
        &mut self,
        artifact: &MediaArtifact,
        url: &str,
        prompt: &PromptConfig,
    ) -> std::result::Result<StructuredResult, AnalyzeError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(artifact.path())
            .arg(url)
            .env(PROMPT_ENV, &prompt.prompt)
            .env(HEADLESS_ENV, if prompt.headless { "1" } else { "0" });
        if let Some(session) = &self.session_file {
            command.env(SESSION_FILE_ENV, session);
        }
        for (key, value) in &prompt.options {
            command.env(format!("{}{}", OPTION_ENV_PREFIX, key.to_uppercase()), value);
        }

        let output = match invoke(command, self.timeout).await {
            Ok(Invocation::Finished(output)) => output,
            Ok(Invocation::TimedOut) => {
                return Err(AnalyzeError::new(
                    AnalyzeErrorKind::Timeout,
                    format!("no analysis within {}s", self.timeout.as_secs()),
                ));
            }
            Err(e) => {
                return Err(AnalyzeError::new(
                    AnalyzeErrorKind::Timeout,
                    format!("failed to execute {}: {}", self.program.display(), e),
                ));
            }
        };

        if !output.status.success() {
            return Err(AnalyzeError::new(
                Self::classify(output.status.code()),
                format!("analyzer exited with {}: {}", output.status, stderr_tail(&output)),
            ));
        }

        parse_analysis(&output.stdout)
    }

    fn name(&self) -> &'static str {
        "command-analyzer"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SourcePlatform;
    use tempfile::TempDir;

    #[test]
    fn acquirer_exit_codes_map_to_kinds() {
        assert_eq!(CommandAcquirer::classify(Some(10)), AcquireErrorKind::NotFound);
        assert_eq!(CommandAcquirer::classify(Some(11)), AcquireErrorKind::RateLimited);
        assert_eq!(
            CommandAcquirer::classify(Some(13)),
            AcquireErrorKind::PermanentUnsupported
        );
        assert_eq!(CommandAcquirer::classify(Some(1)), AcquireErrorKind::TransientNetwork);
        assert_eq!(CommandAcquirer::classify(None), AcquireErrorKind::TransientNetwork);
    }

    #[test]
    fn analyzer_exit_codes_map_to_kinds() {
        assert_eq!(CommandAnalyzer::classify(Some(20)), AnalyzeErrorKind::SessionExpired);
        assert_eq!(CommandAnalyzer::classify(Some(21)), AnalyzeErrorKind::RateLimited);
        assert_eq!(
            CommandAnalyzer::classify(Some(23)),
            AnalyzeErrorKind::PermanentRejected
        );
        assert_eq!(CommandAnalyzer::classify(Some(2)), AnalyzeErrorKind::Timeout);
    }

    #[test]
    fn parse_analysis_renders_scalars() {
        let result =
            parse_analysis(br#"{"brand": "Dove\n\n Men", "score": 7, "note": null}"#).unwrap();
        assert_eq!(result.get("brand"), Some("Dove Men"));
        assert_eq!(result.get("score"), Some("7"));
        assert_eq!(result.get("note"), Some(""));
    }

    #[test]
    fn parse_analysis_rejects_non_objects() {
        let err = parse_analysis(b"[1, 2]").unwrap_err();
        assert_eq!(err.kind, AnalyzeErrorKind::EmptyResponse);
        let err = parse_analysis(b"Sorry, something went wrong").unwrap_err();
        assert_eq!(err.kind, AnalyzeErrorKind::EmptyResponse);
    }

    #[test]
    fn missing_session_file_fails_construction() {
        let temp = TempDir::new().unwrap();
        let result = CommandAnalyzer::new(
            PathBuf::from("analyze"),
            vec![],
            Duration::from_secs(1),
            Some(temp.path().join("session.json")),
        );
        assert!(matches!(result, Err(Error::SessionUnavailable(_))));
    }

    #[test]
    fn from_config_requires_a_command() {
        let config = CollaboratorConfig::default();
        assert!(matches!(
            CommandAcquirer::from_config(&config),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            CommandAnalyzer::from_config(&config),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn from_config_reports_unknown_program() {
        let config = CollaboratorConfig {
            acquire_command: Some(PathBuf::from("nonexistent-reelbatch-acquirer-xyz")),
            ..Default::default()
        };
        assert!(matches!(
            CommandAcquirer::from_config(&config),
            Err(Error::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn invalid_binary_is_a_transient_acquire_failure() {
        let temp = TempDir::new().unwrap();
        let acquirer = CommandAcquirer::new(
            PathBuf::from("/nonexistent/path/to/acquirer"),
            vec![],
            Duration::from_secs(5),
        );
        let request = AcquireRequest {
            url: "https://www.tiktok.com/@a/video/1".to_string(),
            platform: SourcePlatform::TikTok,
            destination: temp.path().join("tiktok_1.mp4"),
        };

        let err = acquirer.acquire(&request).await.unwrap_err();
        assert_eq!(err.kind, AcquireErrorKind::TransientNetwork);
        assert!(err.message.contains("failed to execute"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_script_acquirer_and_analyzer_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();

        let acquire_script = temp.path().join("acquire.sh");
        std::fs::write(&acquire_script, "#!/bin/sh\nprintf 'media' > \"$2\"\n").unwrap();
        std::fs::set_permissions(&acquire_script, std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let analyze_script = temp.path().join("analyze.sh");
        std::fs::write(
            &analyze_script,
            "#!/bin/sh\nprintf '{\"message\": \"%s headless=%s\"}' \"$REELBATCH_PROMPT\" \"$REELBATCH_HEADLESS\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&analyze_script, std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let acquirer = CommandAcquirer::new(acquire_script, vec![], Duration::from_secs(10));
        let url = "https://www.instagram.com/reel/Cabc123/";
        let request = AcquireRequest {
            url: url.to_string(),
            platform: SourcePlatform::Instagram,
            destination: temp.path().join("instagram_Cabc123.mp4"),
        };
        let artifact = acquirer.acquire(&request).await.unwrap();
        assert_eq!(artifact.path(), request.destination.as_path());

        let mut analyzer =
            CommandAnalyzer::new(analyze_script, vec![], Duration::from_secs(10), None).unwrap();
        let prompt = PromptConfig {
            prompt: "describe".to_string(),
            headless: true,
            ..Default::default()
        };
        let result = analyzer.analyze(&artifact, url, &prompt).await.unwrap();
        assert_eq!(result.get("message"), Some("describe headless=1"));

        artifact.reclaim().await.unwrap();
        assert!(!request.destination.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn analyzer_timeout_is_reported_as_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let script = temp.path().join("slow.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let artifact_path = temp.path().join("a.mp4");
        std::fs::write(&artifact_path, b"x").unwrap();
        let artifact = MediaArtifact::locate("https://example.com/a", &artifact_path)
            .await
            .unwrap();

        let mut analyzer =
            CommandAnalyzer::new(script, vec![], Duration::from_millis(100), None).unwrap();
        let err = analyzer
            .analyze(&artifact, "https://example.com/a", &PromptConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, AnalyzeErrorKind::Timeout);
    }
}
