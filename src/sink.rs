//! Append-only CSV result store
//!
//! One row per analyzed URL: `url` followed by the configured result columns. Every
//! append is flushed and synced before it returns. The sink has a single owner (the
//! scheduler's coordinator), which only appends after the one analysis lane reports a
//! result, so it needs no locking of its own.

use crate::collaborators::StructuredResult;
use crate::error::{Error, Result};
use crate::input::URL_COLUMN;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// CSV result store
pub struct ResultSink {
    path: PathBuf,
    columns: Vec<String>,
    writer: csv::Writer<File>,
    rows: u64,
}

impl ResultSink {
    /// Open `path` for appending, creating it with a header if needed
    ///
    /// An existing non-empty file keeps its own header; its column set wins over
    /// `columns`.
    pub fn open(path: &Path, columns: &[String]) -> Result<Self> {
        let store_err = |reason: String| Error::ResultStore {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| store_err(format!("cannot create directory: {}", e)))?;
            }
        }

        let dropped = drop_torn_row(path).map_err(|e| store_err(e.to_string()))?;
        if dropped > 0 {
            tracing::warn!(path = %path.display(), bytes = dropped, "removed torn last row from result store");
        }
        let existing = read_existing(path).map_err(|e| store_err(e.to_string()))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| store_err(format!("cannot open for append: {}", e)))?;

        let fresh = existing.is_none();
        let (columns, rows) = match existing {
            Some(existing) => {
                if existing.columns != columns {
                    tracing::warn!(
                        path = %path.display(),
                        existing = ?existing.columns,
                        configured = ?columns,
                        "result store header differs from configured columns, keeping existing header"
                    );
                }
                (existing.columns, existing.rows)
            }
            None => (columns.to_vec(), 0),
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if fresh {
            let mut header = vec![URL_COLUMN.to_string()];
            header.extend(columns.iter().cloned());
            writer
                .write_record(&header)
                .map_err(|e| store_err(format!("cannot write header: {}", e)))?;
        }

        let mut sink = Self {
            path: path.to_path_buf(),
            columns,
            writer,
            rows,
        };
        sink.sync()?;

        tracing::debug!(path = %sink.path.display(), rows = sink.rows, "result store opened");
        Ok(sink)
    }

    /// Result columns written after `url`
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Location of the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of data rows in the store
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append one row and make it durable
    ///
    /// Missing fields are written empty and fields outside the column set are dropped.
    /// Returns a reference to the row (`<file name>#<row number>`).
    pub fn append(&mut self, url: &str, result: &StructuredResult) -> Result<String> {
        for extra in result
            .fields()
            .keys()
            .filter(|k| !self.columns.iter().any(|c| c == *k))
        {
            tracing::debug!(url = %url, column = %extra, "dropping field outside result columns");
        }

        let mut record = Vec::with_capacity(self.columns.len() + 1);
        record.push(url);
        record.extend(self.columns.iter().map(|c| result.get(c).unwrap_or("")));

        self.writer
            .write_record(&record)
            .map_err(|e| Error::ResultStore {
                path: self.path.clone(),
                reason: format!("cannot append row for {}: {}", url, e),
            })?;
        self.sync()?;

        self.rows += 1;
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("{}#{}", name, self.rows))
    }

    fn sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_data())
            .map_err(|e| Error::ResultStore {
                path: self.path.clone(),
                reason: format!("cannot flush: {}", e),
            })
    }
}

/// URLs that already have a complete, non-blank row in the store at `path`
///
/// Used to reconcile the ledger after a crash between the append and the ledger write.
/// A missing file yields an empty list, and a last row without its line terminator is
/// not counted.
pub fn recorded_urls(path: &Path) -> Result<Vec<String>> {
    if !has_content(path) {
        return Ok(Vec::new());
    }
    let torn = ends_torn(path).map_err(|e| Error::ResultStore {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let store_err = |e: csv::Error| Error::ResultStore {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(store_err)?;
    let headers = reader.headers().map_err(store_err)?.clone();
    let Some(url_index) = headers.iter().position(|h| h == URL_COLUMN) else {
        return Ok(Vec::new());
    };
    let columns: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != url_index)
        .map(|(_, h)| h.to_string())
        .collect();

    let mut records: Vec<_> = reader.records().collect();
    if torn {
        records.pop();
    }

    let mut urls = Vec::new();
    for record in records {
        let Ok(record) = record else {
            continue;
        };
        let Some(url) = record.get(url_index).filter(|u| !u.is_empty()) else {
            continue;
        };
        let result: StructuredResult = headers
            .iter()
            .zip(record.iter())
            .enumerate()
            .filter(|(i, _)| *i != url_index)
            .map(|(_, (h, v))| (h, v))
            .collect();
        if !result.is_blank(&columns) {
            urls.push(url.to_string());
        }
    }
    Ok(urls)
}

struct ExistingStore {
    columns: Vec<String>,
    rows: u64,
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Whether the file's last byte is something other than a line terminator
fn ends_torn(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Truncate an interrupted final row, returning the number of bytes removed
///
/// Record boundaries come from the CSV parser, so quoted fields spanning lines are
/// handled. A torn header empties the file.
fn drop_torn_row(path: &Path) -> std::io::Result<u64> {
    if !has_content(path) || !ends_torn(path)? {
        return Ok(0);
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_path(path)
        .map_err(std::io::Error::other)?;
    let mut record = csv::ByteRecord::new();
    let mut last_start = 0;
    loop {
        let start = reader.position().byte();
        if !reader
            .read_byte_record(&mut record)
            .map_err(std::io::Error::other)?
        {
            break;
        }
        last_start = start;
    }

    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.set_len(last_start)?;
    file.sync_data()?;
    Ok(len - last_start)
}

fn read_existing(path: &Path) -> std::io::Result<Option<ExistingStore>> {
    if !has_content(path) {
        return Ok(None);
    }

    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let headers = reader.headers().map_err(std::io::Error::other)?;
    let columns = headers
        .iter()
        .filter(|h| *h != URL_COLUMN)
        .map(str::to_string)
        .collect();
    let rows = reader.records().count() as u64;

    Ok(Some(ExistingStore { columns, rows }))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn new_store_gets_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        let mut sink = ResultSink::open(&path, &columns(&["message"])).unwrap();

        let r = sink
            .append("https://a", &StructuredResult::new().with("message", "hello"))
            .unwrap();
        assert_eq!(r, "output.csv#1");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "url,message\nhttps://a,hello\n");
    }

    #[test]
    fn missing_fields_are_empty_and_unknown_fields_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        let mut sink = ResultSink::open(&path, &columns(&["brand", "tone"])).unwrap();

        sink.append(
            "https://a",
            &StructuredResult::new().with("tone", "warm").with("debug", "x"),
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "url,brand,tone\nhttps://a,,warm\n");
    }

    #[test]
    fn values_with_commas_and_quotes_are_escaped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        let mut sink = ResultSink::open(&path, &columns(&["message"])).unwrap();

        sink.append(
            "https://a",
            &StructuredResult::new().with("message", r#"Brand: "Dove", Tone: warm"#),
        )
        .unwrap();

        assert_eq!(recorded_urls(&path).unwrap(), vec!["https://a"]);
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[1], r#"Brand: "Dove", Tone: warm"#);
    }

    #[test]
    fn reopen_appends_without_second_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        {
            let mut sink = ResultSink::open(&path, &columns(&["message"])).unwrap();
            sink.append("https://a", &StructuredResult::new().with("message", "1"))
                .unwrap();
        }

        let mut sink = ResultSink::open(&path, &columns(&["message"])).unwrap();
        assert_eq!(sink.rows(), 1);
        let r = sink
            .append("https://b", &StructuredResult::new().with("message", "2"))
            .unwrap();
        assert_eq!(r, "output.csv#2");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "url,message\nhttps://a,1\nhttps://b,2\n");
    }

    #[test]
    fn existing_header_wins_over_configuration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        std::fs::write(&path, "url,brand\n").unwrap();

        let mut sink = ResultSink::open(&path, &columns(&["message"])).unwrap();
        assert_eq!(sink.columns(), &["brand".to_string()]);
        sink.append("https://a", &StructuredResult::new().with("brand", "Dove"))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "url,brand\nhttps://a,Dove\n");
    }

    #[test]
    fn torn_last_row_is_dropped_before_appending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        std::fs::write(&path, "url,message\nhttps://a,ok\nhttps://b,hal").unwrap();

        let mut sink = ResultSink::open(&path, &columns(&["message"])).unwrap();
        assert_eq!(sink.rows(), 1);
        let r = sink
            .append("https://c", &StructuredResult::new().with("message", "fine"))
            .unwrap();
        assert_eq!(r, "output.csv#2");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "url,message\nhttps://a,ok\nhttps://c,fine\n");
    }

    #[test]
    fn torn_row_with_quoted_newline_is_dropped_whole() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        std::fs::write(&path, "url,message\nhttps://a,ok\nhttps://b,\"line one\nline tw").unwrap();

        ResultSink::open(&path, &columns(&["message"])).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "url,message\nhttps://a,ok\n");
    }

    #[test]
    fn torn_header_starts_a_fresh_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        std::fs::write(&path, "url,mess").unwrap();

        let sink = ResultSink::open(&path, &columns(&["message"])).unwrap();
        assert_eq!(sink.rows(), 0);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "url,message\n");
    }

    #[test]
    fn recorded_urls_skips_unterminated_last_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        std::fs::write(&path, "url,message\nhttps://a,ok\nhttps://b,truncat").unwrap();

        assert_eq!(recorded_urls(&path).unwrap(), vec!["https://a"]);
    }

    #[test]
    fn recorded_urls_ignores_blank_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.csv");
        std::fs::write(
            &path,
            "url,brand,tone\nhttps://a,Dove,\nhttps://b,,\nhttps://c,brand,tone\n",
        )
        .unwrap();

        assert_eq!(recorded_urls(&path).unwrap(), vec!["https://a"]);
    }

    #[test]
    fn recorded_urls_of_missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(recorded_urls(&dir.path().join("none.csv")).unwrap().is_empty());
    }

    #[test]
    fn unwritable_location_is_result_store_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let err = ResultSink::open(&blocker.join("output.csv"), &columns(&["message"]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::ResultStore { .. }));
        assert!(err.is_systemic());
    }
}
