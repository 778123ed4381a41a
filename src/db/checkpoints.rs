//! Checkpoint store: the durable resume position of each target.
//!
//! `last_item_id` only moves forward. The single exception is an explicit
//! reset, which zeroes the position and flags the next run as a full restart.

use crate::error::DatabaseError;
use crate::types::{Checkpoint, TargetId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};

use super::{CheckpointRow, Database};

impl Database {
    /// Get the checkpoint of a target, if one was ever written
    pub async fn get_checkpoint(&self, target: &TargetId) -> Result<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT target_id, last_item_id, last_run_at, mode, items_collected
            FROM checkpoints
            WHERE target_id = ?
            "#,
        )
        .bind(target)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get checkpoint: {}",
                e
            )))
        })?;

        Ok(row.map(Checkpoint::from))
    }

    /// Move a target's checkpoint forward to `last_item_id`
    ///
    /// Creates the checkpoint on first use and switches the mode back to
    /// incremental. A position lower than the stored one is ignored with a
    /// warning. The write is durable when this returns.
    ///
    /// Returns whether the checkpoint moved.
    pub async fn advance_checkpoint(
        &self,
        target: &TargetId,
        last_item_id: i64,
        timestamp: DateTime<Utc>,
        items: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (target_id, last_item_id, last_run_at, mode, items_collected)
            VALUES (?, ?, ?, 'incremental', ?)
            ON CONFLICT(target_id) DO UPDATE SET
                last_item_id = excluded.last_item_id,
                last_run_at = excluded.last_run_at,
                mode = 'incremental',
                items_collected = checkpoints.items_collected + excluded.items_collected
            WHERE excluded.last_item_id >= checkpoints.last_item_id
            "#,
        )
        .bind(target)
        .bind(last_item_id)
        .bind(timestamp.timestamp())
        .bind(items as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to advance checkpoint: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                target_id = %target,
                requested = last_item_id,
                "ignoring checkpoint advance below the stored position"
            );
            return Ok(false);
        }

        tracing::debug!(target_id = %target, last_item_id, "checkpoint advanced");
        Ok(true)
    }

    /// Request a full restart of a target on its next run
    ///
    /// Keeps the row (and its lifetime item count), zeroes the position and sets
    /// the mode to full. Returns false when the target has no checkpoint.
    pub async fn reset_checkpoint(&self, target: &TargetId) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE checkpoints
            SET last_item_id = 0, mode = 'full', last_run_at = ?
            WHERE target_id = ?
            "#,
        )
        .bind(now)
        .bind(target)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to reset checkpoint: {}",
                e
            )))
        })?;

        let reset = result.rows_affected() > 0;
        if reset {
            tracing::info!(target_id = %target, "checkpoint reset, next run starts from scratch");
        }
        Ok(reset)
    }

    /// All checkpoints, ordered by target id
    pub async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT target_id, last_item_id, last_run_at, mode, items_collected
            FROM checkpoints
            ORDER BY target_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list checkpoints: {}",
                e
            )))
        })?;

        Ok(rows.into_iter().map(Checkpoint::from).collect())
    }
}
