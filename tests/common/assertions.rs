//! Event collection and result-store inspection helpers

use reelbatch::Event;
use std::path::Path;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Collect every event until `RunFinished` (or the channel closes)
pub fn collect_events(mut events: broadcast::Receiver<Event>) -> JoinHandle<Vec<Event>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let finished = matches!(event, Event::RunFinished { .. });
                    seen.push(event);
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    panic!("event collector lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        seen
    })
}

/// Peak window occupancy reported by `Admitted` events
pub fn peak_window(events: &[Event]) -> usize {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Admitted { in_window, .. } => Some(*in_window),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

/// Position of the first event matching `pred`
pub fn position(events: &[Event], pred: impl Fn(&Event) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

/// Rows in the result store as (url, message) pairs
pub fn result_rows(path: &Path) -> Vec<(String, String)> {
    if !path.exists() {
        return Vec::new();
    }
    let mut reader = csv::Reader::from_path(path).expect("open result store");
    let headers = reader.headers().expect("header").clone();
    assert_eq!(headers.get(0), Some("url"), "url must be the first column");
    reader
        .records()
        .map(|r| {
            let r = r.expect("well-formed row");
            (
                r.get(0).unwrap_or_default().to_string(),
                r.get(1).unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// Number of files left in `dir`
pub fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
