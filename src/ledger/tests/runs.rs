use crate::ledger::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_run_ids_increase_and_tag_entries() {
    let temp_file = NamedTempFile::new().unwrap();
    let ledger = Ledger::open(temp_file.path()).await.unwrap();

    assert_eq!(ledger.current_run_id(), 0);
    let first = ledger.begin_run().await.unwrap();
    let entry = ledger.mark_done("https://a", None).await.unwrap();
    assert_eq!(entry.run_id, first);

    let second = ledger.begin_run().await.unwrap();
    assert!(second > first);
    assert_eq!(ledger.current_run_id(), second);

    ledger.close().await;
}

#[tokio::test]
async fn test_finish_run_records_outcome() {
    let temp_file = NamedTempFile::new().unwrap();
    let ledger = Ledger::open(temp_file.path()).await.unwrap();

    let id = ledger.begin_run().await.unwrap();
    ledger.finish_run("completed", 3, 1).await.unwrap();

    let runs = ledger.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, id);
    assert_eq!(runs[0].outcome.as_deref(), Some("completed"));
    assert_eq!(runs[0].analyzed, 3);
    assert_eq!(runs[0].failed, 1);
    assert!(runs[0].finished_at.is_some());

    ledger.close().await;
}

#[tokio::test]
async fn test_unfinished_run_has_no_outcome() {
    let temp_file = NamedTempFile::new().unwrap();
    let ledger = Ledger::open(temp_file.path()).await.unwrap();

    ledger.begin_run().await.unwrap();
    ledger.finish_run("stopped", 0, 0).await.unwrap();
    ledger.begin_run().await.unwrap();

    let runs = ledger.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs[0].outcome.is_none(), "newest run is still open");
    assert_eq!(runs[1].outcome.as_deref(), Some("stopped"));

    let limited = ledger.recent_runs(1).await.unwrap();
    assert_eq!(limited.len(), 1);

    ledger.close().await;
}

#[tokio::test]
async fn test_recorded_outcome_leaves_shutdown_unclean() {
    let temp_file = NamedTempFile::new().unwrap();
    let ledger = Ledger::open(temp_file.path()).await.unwrap();

    ledger.begin_run().await.unwrap();
    ledger.record_run_outcome("fatal", 1, 0).await.unwrap();

    assert!(ledger.was_unclean_shutdown().await.unwrap());
    let runs = ledger.recent_runs(1).await.unwrap();
    assert_eq!(runs[0].outcome.as_deref(), Some("fatal"));
    assert!(runs[0].finished_at.is_some());

    ledger.finish_run("completed", 1, 0).await.unwrap();
    assert!(!ledger.was_unclean_shutdown().await.unwrap());

    ledger.close().await;
}
