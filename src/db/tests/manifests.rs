use crate::db::*;
use crate::error::DatabaseError;
use crate::Error;
use crate::types::{CheckpointMode, RunCounts, RunManifest, TargetId};
use chrono::{Duration, Utc};
use tempfile::NamedTempFile;

fn manifest(run_id: &str, start_offset_secs: i64) -> RunManifest {
    RunManifest {
        run_id: run_id.to_string(),
        fetcher: "scripted".to_string(),
        target_ids: vec![TargetId::from("a"), TargetId::from("b")],
        mode: CheckpointMode::Incremental,
        item_limit: 100,
        start_ts: Utc::now() + Duration::seconds(start_offset_secs),
        end_ts: None,
        counts: RunCounts::default(),
    }
}

#[tokio::test]
async fn test_insert_and_get_run() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.insert_run(&manifest("run-1", 0)).await.unwrap();

    let run = db.get_run("run-1").await.unwrap().unwrap();
    assert_eq!(run.fetcher, "scripted");
    assert_eq!(run.target_ids, vec![TargetId::from("a"), TargetId::from("b")]);
    assert_eq!(run.item_limit, 100);
    assert!(run.end_ts.is_none());
    assert_eq!(run.counts, RunCounts::default());

    db.close().await;
}

#[tokio::test]
async fn test_finalize_writes_counts_once() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    db.insert_run(&manifest("run-1", 0)).await.unwrap();

    let counts = RunCounts {
        collected: 60,
        throttle_events: 2,
        errors: 1,
        route_rotations: 1,
        media_downloaded: 3,
        media_failed: 0,
    };
    db.finalize_run("run-1", Utc::now(), &counts).await.unwrap();

    let run = db.get_run("run-1").await.unwrap().unwrap();
    assert!(run.end_ts.is_some());
    assert_eq!(run.counts, counts);

    // A finalized manifest is immutable
    let err = db
        .finalize_run("run-1", Utc::now(), &RunCounts::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already finalized"));
    assert_eq!(db.get_run("run-1").await.unwrap().unwrap().counts, counts);

    db.close().await;
}

#[tokio::test]
async fn test_finalize_unknown_run_fails() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let err = db
        .finalize_run("missing", Utc::now(), &RunCounts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Database(DatabaseError::NotFound(_))));

    db.close().await;
}

#[tokio::test]
async fn test_run_history_newest_first() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.insert_run(&manifest("old", -120)).await.unwrap();
    db.insert_run(&manifest("new", 0)).await.unwrap();
    db.insert_run(&manifest("middle", -60)).await.unwrap();

    let history = db.run_history(2).await.unwrap();
    let ids: Vec<&str> = history.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec!["new", "middle"]);

    db.close().await;
}
