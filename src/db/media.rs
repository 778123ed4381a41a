//! Media download outcomes.

use crate::error::DatabaseError;
use crate::types::TargetId;
use crate::{Error, Result};

use super::{Database, MediaDownloadRow, NewMediaDownload};

impl Database {
    /// Record (or overwrite) the outcome of one media download
    pub async fn record_media_download(&self, download: &NewMediaDownload) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO media_downloads (
                target_id, item_id, locator, status, file_path, bytes, attempts, error, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(target_id, item_id, locator) DO UPDATE SET
                status = excluded.status,
                file_path = excluded.file_path,
                bytes = excluded.bytes,
                attempts = media_downloads.attempts + excluded.attempts,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&download.target_id)
        .bind(download.item_id)
        .bind(&download.locator)
        .bind(download.status)
        .bind(&download.file_path)
        .bind(download.bytes)
        .bind(download.attempts)
        .bind(&download.error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to record media download: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Media download outcomes of a target, ordered by item id
    pub async fn media_downloads(&self, target: &TargetId) -> Result<Vec<MediaDownloadRow>> {
        let rows = sqlx::query_as::<_, MediaDownloadRow>(
            r#"
            SELECT target_id, item_id, locator, status, file_path, bytes, attempts, error, updated_at
            FROM media_downloads
            WHERE target_id = ?
            ORDER BY item_id, locator
            "#,
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to query media downloads: {}",
                e
            )))
        })?;

        Ok(rows)
    }
}
