//! Run manifests: one reporting record per collection run.
//!
//! A manifest is written when the run starts and finalized exactly once when it
//! ends; after that it never changes. The engine never reads manifests back to
//! make decisions.

use crate::error::DatabaseError;
use crate::types::{RunCounts, RunManifest};
use crate::{Error, Result};
use chrono::{DateTime, Utc};

use super::{Database, RunManifestRow};

impl Database {
    /// Record the start of a run
    pub async fn insert_run(&self, manifest: &RunManifest) -> Result<()> {
        let target_ids = serde_json::to_string(&manifest.target_ids)?;

        sqlx::query(
            r#"
            INSERT INTO run_manifests (
                run_id, fetcher, target_ids, mode, item_limit, start_ts, end_ts,
                collected, throttle_events, errors, route_rotations,
                media_downloaded, media_failed
            ) VALUES (?, ?, ?, ?, ?, ?, NULL, 0, 0, 0, 0, 0, 0)
            "#,
        )
        .bind(&manifest.run_id)
        .bind(&manifest.fetcher)
        .bind(target_ids)
        .bind(manifest.mode.as_str())
        .bind(manifest.item_limit as i64)
        .bind(manifest.start_ts.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert run manifest: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Close a run with its final counters
    ///
    /// Fails if the run does not exist or was already finalized.
    pub async fn finalize_run(
        &self,
        run_id: &str,
        end_ts: DateTime<Utc>,
        counts: &RunCounts,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE run_manifests
            SET end_ts = ?, collected = ?, throttle_events = ?, errors = ?,
                route_rotations = ?, media_downloaded = ?, media_failed = ?
            WHERE run_id = ? AND end_ts IS NULL
            "#,
        )
        .bind(end_ts.timestamp())
        .bind(counts.collected as i64)
        .bind(counts.throttle_events as i64)
        .bind(counts.errors as i64)
        .bind(counts.route_rotations as i64)
        .bind(counts.media_downloaded as i64)
        .bind(counts.media_failed as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to finalize run manifest: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return match self.get_run(run_id).await? {
                Some(_) => Err(Error::Other(format!("run {} is already finalized", run_id))),
                None => Err(Error::Database(DatabaseError::NotFound(format!(
                    "run {}",
                    run_id
                )))),
            };
        }

        tracing::info!(
            run_id,
            collected = counts.collected,
            throttle_events = counts.throttle_events,
            errors = counts.errors,
            "run finalized"
        );
        Ok(())
    }

    /// Get one run manifest
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunManifest>> {
        let row = sqlx::query_as::<_, RunManifestRow>(
            r#"
            SELECT run_id, fetcher, target_ids, mode, item_limit, start_ts, end_ts,
                   collected, throttle_events, errors, route_rotations,
                   media_downloaded, media_failed
            FROM run_manifests
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get run manifest: {}",
                e
            )))
        })?;

        Ok(row.map(RunManifest::from))
    }

    /// Most recent runs first
    pub async fn run_history(&self, limit: usize) -> Result<Vec<RunManifest>> {
        let rows = sqlx::query_as::<_, RunManifestRow>(
            r#"
            SELECT run_id, fetcher, target_ids, mode, item_limit, start_ts, end_ts,
                   collected, throttle_events, errors, route_rotations,
                   media_downloaded, media_failed
            FROM run_manifests
            ORDER BY start_ts DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to query run history: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(RunManifest::from).collect())
    }
}
