//! Input list loading
//!
//! The input is a CSV file with a `url` column. Values are trimmed, empty cells are
//! skipped and duplicates are dropped keeping the first occurrence, so the resulting
//! order is the order in which items are admitted.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::Path;

/// Name of the required input column
pub const URL_COLUMN: &str = "url";

/// Read the ordered, de-duplicated URL list from `path`
///
/// A missing file or missing `url` column is reported as `Error::InvalidInput`.
pub fn load_urls(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| Error::InvalidInput(format!("cannot read {}: {}", path.display(), e)))?;
    let column = reader
        .headers()
        .map_err(|e| Error::InvalidInput(format!("cannot read header of {}: {}", path.display(), e)))?
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(URL_COLUMN))
        .ok_or_else(|| {
            Error::InvalidInput(format!("{} has no '{}' column", path.display(), URL_COLUMN))
        })?;

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    let mut total = 0usize;
    for record in reader.records() {
        let record = record.map_err(|e| {
            Error::InvalidInput(format!("malformed row in {}: {}", path.display(), e))
        })?;
        let Some(url) = record.get(column).map(str::trim) else {
            continue;
        };
        if url.is_empty() {
            continue;
        }
        total += 1;
        if seen.insert(url.to_string()) {
            urls.push(url.to_string());
        }
    }

    tracing::info!(
        unique = urls.len(),
        total,
        path = %path.display(),
        "loaded input list"
    );
    Ok(urls)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_input(dir: &TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("data.csv");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn dedups_preserving_first_occurrence() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "url\nhttps://a\nhttps://b\n https://a \nhttps://c\n");
        assert_eq!(
            load_urls(&path).unwrap(),
            vec!["https://a", "https://b", "https://c"]
        );
    }

    #[test]
    fn skips_empty_cells_and_finds_column_by_name() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "id,URL\n1,https://a\n2,\n3,https://b\n");
        assert_eq!(load_urls(&path).unwrap(), vec!["https://a", "https://b"]);
    }

    #[test]
    fn missing_column_is_invalid_input() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "link\nhttps://a\n");
        assert!(matches!(load_urls(&path), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn missing_file_is_invalid_input_not_systemic() {
        let dir = TempDir::new().unwrap();
        let err = load_urls(&dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!err.is_systemic());
    }

    #[test]
    fn header_only_file_yields_empty_list() {
        let dir = TempDir::new().unwrap();
        let path = write_input(&dir, "url\n");
        assert!(load_urls(&path).unwrap().is_empty());
    }
}
