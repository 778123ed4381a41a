use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_database_creation() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path();

    let db = Database::new(db_path).await.unwrap();

    // Verify tables exist
    let mut conn = db.pool.acquire().await.unwrap();

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

    assert!(tables.contains(&"checkpoints".to_string()));
    assert!(tables.contains(&"continuity".to_string()));
    assert!(tables.contains(&"status_history".to_string()));
    assert!(tables.contains(&"run_manifests".to_string()));
    assert!(tables.contains(&"items".to_string()));
    assert!(tables.contains(&"media_downloads".to_string()));
    assert!(tables.contains(&"continuity_targets".to_string()));
    assert!(tables.contains(&"schema_version".to_string()));

    drop(conn);
    db.close().await;
}

#[tokio::test]
async fn test_reopen_keeps_schema_version() {
    let temp_file = NamedTempFile::new().unwrap();

    {
        let db = Database::new(temp_file.path()).await.unwrap();
        db.close().await;
    }

    // Migrations must be idempotent across restarts
    let db = Database::new(temp_file.path()).await.unwrap();
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(versions, vec![1, 2, 3]);

    db.close().await;
}

#[tokio::test]
async fn test_creates_missing_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.db");

    let db = Database::new(&path).await.unwrap();
    assert!(path.exists());

    db.close().await;
}
