use crate::db::*;
use crate::types::{ContinuityStatus, TargetId};
use tempfile::NamedTempFile;

fn seen(item_id: i64, text: &str) -> Observation {
    Observation {
        item_id,
        status: ContinuityStatus::Observed,
        text_checksum: Some(text_checksum(text)),
        text_length: Some(text.chars().count() as i64),
    }
}

fn removed(item_id: i64) -> Observation {
    Observation {
        item_id,
        status: ContinuityStatus::Deleted,
        text_checksum: None,
        text_length: None,
    }
}

#[test]
fn test_text_checksum_is_short_and_stable() {
    let a = text_checksum("hello");
    assert_eq!(a.len(), 16);
    assert_eq!(a, text_checksum("hello"));
    assert_ne!(a, text_checksum("hello!"));
}

#[tokio::test]
async fn test_expected_range_creates_unknown_rows() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    assert_eq!(db.record_expected_range(&target, 1, 10).await.unwrap(), 10);
    // Overlapping range only adds the new ids
    assert_eq!(db.record_expected_range(&target, 5, 12).await.unwrap(), 2);

    assert_eq!(db.count_status(&target, ContinuityStatus::Unknown).await.unwrap(), 12);
    assert_eq!(db.detect_gaps(&target).await.unwrap(), (1..=12).collect::<Vec<_>>());

    db.close().await;
}

#[tokio::test]
async fn test_expected_range_ignores_invalid_bounds() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    assert_eq!(db.record_expected_range(&target, 0, 10).await.unwrap(), 0);
    assert_eq!(db.record_expected_range(&target, 10, 9).await.unwrap(), 0);
    assert!(db.detect_gaps(&target).await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_expected_range_larger_than_one_batch() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    assert_eq!(db.record_expected_range(&target, 1, 1000).await.unwrap(), 1000);

    db.close().await;
}

#[tokio::test]
async fn test_metrics_with_observed_deleted_and_unknown() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    let mut observations: Vec<Observation> = (1..=90).map(|id| seen(id, &format!("item {}", id))).collect();
    observations.extend((91..=95).map(removed));

    let update = db.apply_page(&target, Some((1, 100)), &observations).await.unwrap();
    assert_eq!(update.expected_added, 100);
    assert_eq!(update.gaps, 5);
    assert_eq!(update.deleted, 5);

    let metrics = db.compute_metrics(&target).await.unwrap();
    assert_eq!(metrics.expected, 100);
    assert_eq!(metrics.observed, 90);
    assert_eq!(metrics.deleted, 5);
    assert_eq!(metrics.gaps, 5);
    assert!((metrics.coverage_rate - 0.90).abs() < 1e-9);
    assert!((metrics.deletion_rate - 0.05).abs() < 1e-9);
    assert!((metrics.gap_ratio - 0.05).abs() < 1e-9);
    assert!(metrics.first_observed_at.is_some());
    assert!(metrics.last_observed_at.is_some());

    assert_eq!(db.detect_gaps(&target).await.unwrap(), vec![96, 97, 98, 99, 100]);

    db.close().await;
}

#[tokio::test]
async fn test_absence_never_becomes_deleted() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    db.apply_page(&target, Some((1, 3)), &[seen(1, "a"), seen(3, "c")]).await.unwrap();

    let record = db.get_continuity_record(&target, 2).await.unwrap().unwrap();
    assert_eq!(record.status, ContinuityStatus::Unknown);
    assert_eq!(db.count_status(&target, ContinuityStatus::Deleted).await.unwrap(), 0);

    db.close().await;
}

#[tokio::test]
async fn test_later_observation_fills_gap() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    db.apply_page(&target, Some((1, 3)), &[seen(1, "a"), seen(3, "c")]).await.unwrap();
    assert_eq!(db.detect_gaps(&target).await.unwrap(), vec![2]);

    let status = db.mark_observed(&target, &seen(2, "b")).await.unwrap();
    assert_eq!(status, ContinuityStatus::Observed);
    assert!(db.detect_gaps(&target).await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_unknown_observation_does_not_override() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    db.mark_observed(&target, &seen(5, "x")).await.unwrap();
    let unknown = Observation {
        item_id: 5,
        status: ContinuityStatus::Unknown,
        text_checksum: None,
        text_length: None,
    };
    let status = db.mark_observed(&target, &unknown).await.unwrap();
    assert_eq!(status, ContinuityStatus::Observed);

    db.close().await;
}

#[tokio::test]
async fn test_changed_text_marks_edited_and_records_history() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    assert_eq!(
        db.mark_observed(&target, &seen(7, "original")).await.unwrap(),
        ContinuityStatus::Observed
    );
    assert_eq!(
        db.mark_observed(&target, &seen(7, "original, amended")).await.unwrap(),
        ContinuityStatus::Edited
    );
    // Seeing the amended text again keeps the edited status
    assert_eq!(
        db.mark_observed(&target, &seen(7, "original, amended")).await.unwrap(),
        ContinuityStatus::Edited
    );

    let history = db.status_history(&target, 7).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, "observed");
    assert_eq!(history[1].status, "edited");
    assert_ne!(history[0].text_checksum, history[1].text_checksum);

    let metrics = db.compute_metrics(&target).await.unwrap();
    assert_eq!(metrics.observed, 1);
    assert_eq!(metrics.edited, 1);
    assert!((metrics.edit_rate - 1.0).abs() < 1e-9);

    db.close().await;
}

#[tokio::test]
async fn test_missing_checksum_does_not_count_as_edit() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    db.mark_observed(&target, &seen(1, "text")).await.unwrap();
    let without_checksum = Observation {
        item_id: 1,
        status: ContinuityStatus::Observed,
        text_checksum: None,
        text_length: None,
    };
    assert_eq!(
        db.mark_observed(&target, &without_checksum).await.unwrap(),
        ContinuityStatus::Observed
    );

    let record = db.get_continuity_record(&target, 1).await.unwrap().unwrap();
    assert_eq!(record.text_checksum, Some(text_checksum("text")));

    db.close().await;
}

#[tokio::test]
async fn test_apply_page_twice_is_idempotent() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    let page: Vec<Observation> = (501..=560).map(|id| seen(id, "same")).collect();
    db.apply_page(&target, Some((501, 560)), &page).await.unwrap();
    let again = db.apply_page(&target, Some((501, 560)), &page).await.unwrap();
    assert_eq!(again.expected_added, 0);
    assert_eq!(again.edited, 0);

    assert_eq!(db.count_status(&target, ContinuityStatus::Observed).await.unwrap(), 60);
    assert_eq!(db.status_history(&target, 530).await.unwrap().len(), 1);

    db.close().await;
}

#[tokio::test]
async fn test_ledgers_are_isolated_per_target() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let a = TargetId::from("a");
    let b = TargetId::from("b");

    db.apply_page(&a, Some((1, 10)), &[seen(1, "x")]).await.unwrap();
    db.apply_page(&b, Some((1, 2)), &[seen(1, "x"), seen(2, "y")]).await.unwrap();

    assert_eq!(db.detect_gaps(&a).await.unwrap().len(), 9);
    assert!(db.detect_gaps(&b).await.unwrap().is_empty());
    assert_eq!(db.compute_metrics(&b).await.unwrap().expected, 2);

    db.close().await;
}

#[tokio::test]
async fn test_metrics_of_unknown_target_are_empty() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    let metrics = db.compute_metrics(&TargetId::from("ghost")).await.unwrap();
    assert_eq!(metrics.expected, 0);
    assert_eq!(metrics.gap_ratio, 0.0);
    assert!(metrics.first_observed_at.is_none());

    db.close().await;
}

#[tokio::test]
async fn test_sparse_ids_are_not_counted_as_gaps() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    let target = TargetId::from("news");

    let page = [seen(10, "a"), seen(20, "b"), seen(30, "c")];
    let update = db.apply_page(&target, None, &page).await.unwrap();
    assert_eq!(update.gaps, 0);
    assert!(db.is_sparse(&target).await.unwrap());

    let metrics = db.compute_metrics(&target).await.unwrap();
    assert_eq!(metrics.expected, 3);
    assert_eq!(metrics.observed, 3);
    assert_eq!(metrics.gaps, 0);
    assert_eq!(metrics.gap_ratio, 0.0);
    assert!(db.detect_gaps(&target).await.unwrap().is_empty());

    // Later pages cannot make the target dense again
    db.apply_page(&target, Some((31, 40)), &[seen(40, "d")]).await.unwrap();
    assert!(db.is_sparse(&target).await.unwrap());
    assert_eq!(db.detect_gaps(&target).await.unwrap(), (31..=39).collect::<Vec<_>>());

    db.close().await;
}
