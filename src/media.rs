//! Media artifacts and the directory that holds them
//!
//! An artifact is the on-disk file an acquirer produced for one URL. Its name is a pure
//! function of the URL ([`artifact_file_name`]), so a restart finds what an earlier run
//! left behind. [`MediaArtifact`] is deliberately not `Clone`: exactly one owner decides
//! whether the file is reclaimed or retained.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static TIKTOK_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/video/(\d+)").ok());
static INSTAGRAM_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/(?:p|reel|reels)/([A-Za-z0-9_-]+)").ok());

/// Source platform, derived from the URL host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePlatform {
    /// tiktok.com and its short-link hosts
    TikTok,
    /// instagram.com
    Instagram,
    /// Anything else; acquirers decide whether they can handle it
    Unknown,
}

impl SourcePlatform {
    /// Detect the platform of `url`
    ///
    /// Unparseable URLs are `Unknown`.
    pub fn detect(url: &str) -> Self {
        let host = match url::Url::parse(url) {
            Ok(parsed) => parsed.host_str().unwrap_or_default().to_ascii_lowercase(),
            Err(_) => return SourcePlatform::Unknown,
        };
        if host.contains("tiktok") {
            SourcePlatform::TikTok
        } else if host.contains("instagram") {
            SourcePlatform::Instagram
        } else {
            SourcePlatform::Unknown
        }
    }

    /// Lowercase name used in artifact file names
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePlatform::TikTok => "tiktok",
            SourcePlatform::Instagram => "instagram",
            SourcePlatform::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SourcePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn capture(pattern: &LazyLock<Option<Regex>>, url: &str) -> Option<String> {
    let regex = pattern.as_ref()?;
    regex
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn url_digest(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

/// Deterministic artifact file name for `url`: `<platform>_<id>.mp4`
///
/// The id is the TikTok video id or Instagram shortcode when the URL carries one,
/// otherwise a 16-hex-digit SHA-256 prefix of the URL.
pub fn artifact_file_name(url: &str) -> String {
    let platform = SourcePlatform::detect(url);
    let id = match platform {
        SourcePlatform::TikTok => capture(&TIKTOK_ID, url),
        SourcePlatform::Instagram => capture(&INSTAGRAM_ID, url),
        SourcePlatform::Unknown => None,
    }
    .unwrap_or_else(|| url_digest(url));
    format!("{}_{}.mp4", platform, id)
}

/// Full artifact path for `url` under `dir`
pub fn artifact_path(dir: &Path, url: &str) -> PathBuf {
    dir.join(artifact_file_name(url))
}

/// A fetched media file, owned by exactly one work item
#[derive(Debug)]
pub struct MediaArtifact {
    url: String,
    path: PathBuf,
    size: u64,
}

impl MediaArtifact {
    /// Wrap a file an acquirer has just written
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            size,
        }
    }

    /// Adopt a non-empty file already present at `path`
    pub async fn locate(url: &str, path: &Path) -> Option<Self> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        if metadata.is_file() && metadata.len() > 0 {
            Some(Self::new(url, path, metadata.len()))
        } else {
            None
        }
    }

    /// URL this artifact was acquired for
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Location on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes when acquired
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Delete the file. A file that is already gone counts as reclaimed.
    pub async fn reclaim(self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Give up ownership without deleting, returning the path left on disk
    pub fn retain(self) -> PathBuf {
        self.path
    }
}

/// Remove whatever an interrupted or failed acquisition left at `path`
pub async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "failed to remove partial artifact"
        ),
    }
}

/// Delete artifacts in `dir` that belong to URLs already completed
///
/// Returns the number of files removed. Files that do not correspond to any URL in
/// `done_urls` are left alone, as are files whose name is shared with a URL in
/// `wanted_urls` (distinct URLs for the same video map to the same file).
pub async fn sweep_orphans<'a, I, W>(
    dir: &Path,
    done_urls: I,
    wanted_urls: W,
) -> Result<usize>
where
    I: IntoIterator<Item = &'a str>,
    W: IntoIterator<Item = &'a str>,
{
    if !tokio::fs::try_exists(dir).await? {
        return Ok(0);
    }

    let wanted: HashSet<String> = wanted_urls.into_iter().map(artifact_file_name).collect();
    let done_names: HashSet<String> = done_urls
        .into_iter()
        .map(artifact_file_name)
        .filter(|name| !wanted.contains(name))
        .collect();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !done_names.contains(name) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(
                path = %entry.path().display(),
                error = %e,
                "failed to sweep leftover artifact"
            ),
        }
    }

    if removed > 0 {
        tracing::info!(removed, dir = %dir.display(), "swept artifacts of completed items");
    }
    Ok(removed)
}

/// Check that `dir` has at least `min_free` bytes available
///
/// Checks the parent when `dir` does not exist yet.
pub fn check_free_space(dir: &Path, min_free: u64) -> Result<()> {
    let check_path = if dir.exists() {
        dir
    } else {
        match dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    };

    let available = get_available_space(check_path).map_err(|e| {
        Error::DiskSpaceCheckFailed(format!(
            "failed to read free space of {}: {}",
            check_path.display(),
            e
        ))
    })?;

    if available < min_free {
        return Err(Error::InsufficientSpace {
            required: min_free,
            available,
        });
    }
    Ok(())
}

/// Get available disk space for a given path
///
/// Uses `statvfs` on Unix and `GetDiskFreeSpaceExW` on Windows.
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zero-initialized and
        // only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // f_bavail: blocks available to unprivileged users
            #[allow(clippy::unnecessary_cast)]
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every out pointer refers to a live u64.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut total_free_bytes: u64 = 0;
            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut total_bytes as *mut u64 as *mut _,
                &mut total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }
            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk space check not supported on this platform",
        ))
    }
}
