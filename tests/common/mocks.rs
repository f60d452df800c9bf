//! Scripted collaborators that record how the scheduler drives them

use async_trait::async_trait;
use reelbatch::{
    AcquireError, AcquireErrorKind, AcquireRequest, Acquirer, AnalyzeError, AnalyzeErrorKind,
    Analyzer, MediaArtifact, PromptConfig, StructuredResult,
};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks the current and peak number of concurrent calls
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest concurrency observed
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// What the collaborators observed, shared with the test
#[derive(Default)]
pub struct Probe {
    /// URLs passed to the acquirer, one entry per call
    pub acquire_calls: Mutex<Vec<String>>,
    /// URLs passed to the analyzer, one entry per call
    pub analyze_calls: Mutex<Vec<String>>,
    /// Concurrent acquisitions
    pub acquiring: Gauge,
    /// Concurrent analyses
    pub analyzing: Gauge,
    /// Most artifact files seen on disk at the start of any call
    pub peak_artifacts: AtomicUsize,
    /// Artifact directory to count files in
    pub artifact_dir: Mutex<Option<PathBuf>>,
    /// Analyzer calls whose artifact was not on disk
    pub missing_during_analysis: AtomicUsize,
}

impl Probe {
    /// Shared probe watching `artifact_dir`
    pub fn watching(artifact_dir: PathBuf) -> Arc<Self> {
        let probe = Self::default();
        *probe.artifact_dir.lock().unwrap() = Some(artifact_dir);
        Arc::new(probe)
    }

    /// Acquirer calls for `url`
    pub fn acquires_of(&self, url: &str) -> usize {
        self.acquire_calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    /// Analyzer calls for `url`
    pub fn analyses_of(&self, url: &str) -> usize {
        self.analyze_calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    /// Total analyzer calls
    pub fn total_analyses(&self) -> usize {
        self.analyze_calls.lock().unwrap().len()
    }

    /// Total acquirer calls
    pub fn total_acquires(&self) -> usize {
        self.acquire_calls.lock().unwrap().len()
    }

    fn sample_artifacts(&self) {
        let dir = self.artifact_dir.lock().unwrap().clone();
        if let Some(dir) = dir {
            let count = std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0);
            self.peak_artifacts.fetch_max(count, Ordering::SeqCst);
        }
    }
}

/// Acquirer that writes a small file per URL, following a per-URL script of failures
pub struct MockAcquirer {
    probe: Arc<Probe>,
    delay: Duration,
    script: Mutex<HashMap<String, VecDeque<AcquireErrorKind>>>,
    stalls: HashMap<String, Duration>,
}

impl MockAcquirer {
    /// Always succeeds after `delay`
    pub fn new(probe: Arc<Probe>, delay: Duration) -> Self {
        Self {
            probe,
            delay,
            script: Mutex::new(HashMap::new()),
            stalls: HashMap::new(),
        }
    }

    /// Take `delay` instead of the default for every call with `url`
    pub fn stall(mut self, url: &str, delay: Duration) -> Self {
        self.stalls.insert(url.to_string(), delay);
        self
    }

    /// Fail the next call for `url` with `kind`
    pub fn fail(self, url: &str, kind: AcquireErrorKind) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(kind);
        self
    }
}

#[async_trait]
impl Acquirer for MockAcquirer {
    async fn acquire(&self, request: &AcquireRequest) -> Result<MediaArtifact, AcquireError> {
        self.probe.acquiring.enter();
        self.probe.sample_artifacts();
        self.probe
            .acquire_calls
            .lock()
            .unwrap()
            .push(request.url.clone());

        let delay = self.stalls.get(&request.url).copied().unwrap_or(self.delay);
        tokio::time::sleep(delay).await;
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(|q| q.pop_front());

        let result = match scripted {
            Some(kind) => {
                // Leave a partial file behind like an interrupted download would
                let _ = tokio::fs::write(&request.destination, b"par").await;
                Err(AcquireError::new(kind, "scripted failure"))
            }
            None => match tokio::fs::write(&request.destination, b"media bytes").await {
                Ok(()) => Ok(MediaArtifact::new(&request.url, &request.destination, 11)),
                Err(e) => Err(AcquireError::new(
                    AcquireErrorKind::TransientNetwork,
                    e.to_string(),
                )),
            },
        };
        self.probe.acquiring.leave();
        result
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// One scripted analyzer response
#[derive(Clone, Debug)]
pub enum Reply {
    /// Fail with this kind
    Fail(AnalyzeErrorKind),
    /// Return a result with no usable values
    Blank,
    /// Sleep this long, then succeed
    Slow(Duration),
}

/// Analyzer that follows a per-URL script and succeeds once the script runs out
pub struct MockAnalyzer {
    probe: Arc<Probe>,
    delay: Duration,
    script: HashMap<String, VecDeque<Reply>>,
}

impl MockAnalyzer {
    /// Succeeds after `delay` unless scripted otherwise
    pub fn new(probe: Arc<Probe>, delay: Duration) -> Self {
        Self {
            probe,
            delay,
            script: HashMap::new(),
        }
    }

    /// Queue `reply` for the next call with `url`
    pub fn then(mut self, url: &str, reply: Reply) -> Self {
        self.script.entry(url.to_string()).or_default().push_back(reply);
        self
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(
        &mut self,
        artifact: &MediaArtifact,
        url: &str,
        _prompt: &PromptConfig,
    ) -> Result<StructuredResult, AnalyzeError> {
        self.probe.analyzing.enter();
        self.probe.sample_artifacts();
        self.probe.analyze_calls.lock().unwrap().push(url.to_string());
        if !artifact.path().exists() {
            self.probe.missing_during_analysis.fetch_add(1, Ordering::SeqCst);
        }

        let reply = self.script.get_mut(url).and_then(|q| q.pop_front());
        let result = match reply {
            Some(Reply::Fail(kind)) => {
                tokio::time::sleep(self.delay).await;
                Err(AnalyzeError::new(kind, "scripted failure"))
            }
            Some(Reply::Blank) => {
                tokio::time::sleep(self.delay).await;
                Ok(StructuredResult::new().with("message", ""))
            }
            Some(Reply::Slow(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(StructuredResult::new().with("message", format!("analysis of {}", url)))
            }
            None => {
                tokio::time::sleep(self.delay).await;
                Ok(StructuredResult::new().with("message", format!("analysis of {}", url)))
            }
        };
        self.probe.analyzing.leave();
        result
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
