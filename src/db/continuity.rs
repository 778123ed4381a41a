//! Continuity ledger: expected vs observed item ids per target.
//!
//! Every id in `[min_seen, max_seen]` is expected. Ids that were never observed
//! or explicitly reported deleted are gaps. Absence alone never makes an id
//! `deleted`; it stays `unknown` until a later run sees it or the remote
//! explicitly reports its removal.
//!
//! Targets whose ids are not dense are flagged `sparse`. Their expected set is
//! just the ids the ledger holds a row for, so the space between two
//! consecutive ids is never counted as missing.
//!
//! Each observation is also appended to `status_history`, which is where edits
//! are detected: a text checksum that differs from the previously recorded one
//! turns the id into `edited`, and it stays that way.

use crate::error::DatabaseError;
use crate::types::{ContinuityMetrics, ContinuityRecord, ContinuityStatus, TargetId};
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::{ContinuityRow, Database, LedgerUpdate, Observation, StatusHistoryRow, from_timestamp};

/// Checksum used for edit detection: first 16 hex chars of the text's SHA-256
pub fn text_checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn query_failed(what: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("Failed to {}: {}", what, e)))
}

impl Database {
    /// Declare `[low, high]` as expected for a target
    ///
    /// Ids without a row get one in state `unknown`; existing rows are left
    /// untouched. Returns the number of new rows.
    pub async fn record_expected_range(&self, target: &TargetId, low: i64, high: i64) -> Result<u64> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| query_failed("acquire connection", e))?;
        let now = chrono::Utc::now().timestamp();
        Self::insert_expected_range(&mut conn, target, low, high, now).await
    }

    /// Record what was seen for one item id
    ///
    /// Returns the status actually stored, which is `edited` instead of
    /// `observed` when the text checksum changed since an earlier observation.
    pub async fn mark_observed(
        &self,
        target: &TargetId,
        observation: &Observation,
    ) -> Result<ContinuityStatus> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| query_failed("acquire connection", e))?;
        let now = chrono::Utc::now().timestamp();
        Self::observe(&mut conn, target, observation, now).await
    }

    /// Reconcile one committed page in a single transaction
    ///
    /// `range` is the id span the page covered (`[previous_max + 1, page_max]`);
    /// it is None when the backend's ids are not dense enough for gap tracking.
    /// Either the whole page lands in the ledger or none of it does.
    pub async fn apply_page(
        &self,
        target: &TargetId,
        range: Option<(i64, i64)>,
        observations: &[Observation],
    ) -> Result<LedgerUpdate> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("begin ledger transaction", e))?;

        let mut update = LedgerUpdate::default();

        if range.is_none() {
            Self::mark_sparse(&mut *tx, target).await?;
        }

        if let Some((low, high)) = range {
            update.expected_added =
                Self::insert_expected_range(&mut *tx, target, low, high, now).await?;
            let span = (high - low + 1).max(0) as u64;
            let accounted = observations
                .iter()
                .filter(|o| o.item_id >= low && o.item_id <= high)
                .filter(|o| o.status.is_observed() || o.status == ContinuityStatus::Deleted)
                .count() as u64;
            update.gaps = span.saturating_sub(accounted);
        }

        for observation in observations {
            let status = Self::observe(&mut *tx, target, observation, now).await?;
            match status {
                ContinuityStatus::Edited => update.edited += 1,
                ContinuityStatus::Deleted => update.deleted += 1,
                _ => {}
            }
            update.observed += 1;
        }

        tx.commit()
            .await
            .map_err(|e| query_failed("commit ledger transaction", e))?;

        tracing::debug!(
            target_id = %target,
            observed = update.observed,
            gaps = update.gaps,
            edited = update.edited,
            "ledger updated"
        );
        Ok(update)
    }

    /// Completeness metrics for a target
    pub async fn compute_metrics(&self, target: &TargetId) -> Result<ContinuityMetrics> {
        let expected = if self.is_sparse(target).await? {
            let rows: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM continuity WHERE target_id = ?")
                    .bind(target)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| query_failed("count continuity rows", e))?;
            rows.max(0) as u64
        } else {
            match self.expected_bounds(target).await? {
                (Some(min), Some(max)) if max >= min => (max - min + 1) as u64,
                _ => 0,
            }
        };

        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM continuity
            WHERE target_id = ?
            GROUP BY status
            "#,
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("count continuity statuses", e))?;

        let (mut observed, mut deleted, mut inaccessible, mut edited) = (0u64, 0u64, 0u64, 0u64);
        for (status, count) in counts {
            let count = count.max(0) as u64;
            match ContinuityStatus::parse(&status) {
                ContinuityStatus::Observed => observed += count,
                ContinuityStatus::Edited => {
                    observed += count;
                    edited += count;
                }
                ContinuityStatus::Deleted => deleted += count,
                ContinuityStatus::Inaccessible => inaccessible += count,
                ContinuityStatus::Unknown => {}
            }
        }

        let (first, last): (Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT MIN(observed_at), MAX(observed_at) FROM status_history
            WHERE target_id = ? AND status IN ('observed', 'edited')
            "#,
        )
        .bind(target)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("query observation window", e))?;

        let mut metrics =
            ContinuityMetrics::from_counts(expected, observed, deleted, inaccessible, edited);
        metrics.first_observed_at = first.map(from_timestamp);
        metrics.last_observed_at = last.map(from_timestamp);
        Ok(metrics)
    }

    /// Ids in the expected range that were neither observed nor reported deleted
    ///
    /// For a sparse target only ids with a ledger row can be gaps.
    pub async fn detect_gaps(&self, target: &TargetId) -> Result<Vec<i64>> {
        if self.is_sparse(target).await? {
            return sqlx::query_scalar(
                r#"
                SELECT expected_item_id FROM continuity
                WHERE target_id = ? AND status IN ('unknown', 'inaccessible')
                ORDER BY expected_item_id
                "#,
            )
            .bind(target)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("list unaccounted ids", e));
        }

        let (Some(min), Some(max)) = self.expected_bounds(target).await? else {
            return Ok(Vec::new());
        };

        let accounted: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT expected_item_id FROM continuity
            WHERE target_id = ? AND status IN ('observed', 'edited', 'deleted')
            ORDER BY expected_item_id
            "#,
        )
        .bind(target)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("list accounted ids", e))?;

        let mut gaps = Vec::new();
        let mut accounted = accounted.into_iter().peekable();
        for id in min..=max {
            if accounted.next_if_eq(&id).is_none() {
                gaps.push(id);
            }
        }
        Ok(gaps)
    }

    /// Ledger row for one id
    pub async fn get_continuity_record(
        &self,
        target: &TargetId,
        item_id: i64,
    ) -> Result<Option<ContinuityRecord>> {
        let row = sqlx::query_as::<_, ContinuityRow>(
            r#"
            SELECT target_id, expected_item_id, status, first_seen_at, last_checked_at, text_checksum
            FROM continuity
            WHERE target_id = ? AND expected_item_id = ?
            "#,
        )
        .bind(target)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("get continuity record", e))?;

        Ok(row.map(ContinuityRecord::from))
    }

    /// Number of ledger rows in a given status
    pub async fn count_status(&self, target: &TargetId, status: ContinuityStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM continuity WHERE target_id = ? AND status = ?",
        )
        .bind(target)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("count continuity rows", e))?;

        Ok(count.max(0) as u64)
    }

    /// Observation history of one id, oldest first
    pub async fn status_history(&self, target: &TargetId, item_id: i64) -> Result<Vec<StatusHistoryRow>> {
        sqlx::query_as::<_, StatusHistoryRow>(
            r#"
            SELECT id, target_id, item_id, observed_at, status, text_checksum, text_length
            FROM status_history
            WHERE target_id = ? AND item_id = ?
            ORDER BY id
            "#,
        )
        .bind(target)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("get status history", e))
    }

    /// Whether gap tracking by id range is off for a target
    pub async fn is_sparse(&self, target: &TargetId) -> Result<bool> {
        let sparse: Option<bool> =
            sqlx::query_scalar("SELECT sparse_ids FROM continuity_targets WHERE target_id = ?")
                .bind(target)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| query_failed("read target density", e))?;
        Ok(sparse.unwrap_or(false))
    }

    // Sticky: a target never goes back to dense
    async fn mark_sparse(conn: &mut SqliteConnection, target: &TargetId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO continuity_targets (target_id, sparse_ids) VALUES (?, 1)
            ON CONFLICT(target_id) DO UPDATE SET sparse_ids = 1
            "#,
        )
        .bind(target)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_failed("mark target sparse", e))?;
        Ok(())
    }

    async fn expected_bounds(&self, target: &TargetId) -> Result<(Option<i64>, Option<i64>)> {
        sqlx::query_as(
            "SELECT MIN(expected_item_id), MAX(expected_item_id) FROM continuity WHERE target_id = ?",
        )
        .bind(target)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("query expected range", e))
    }

    async fn insert_expected_range(
        conn: &mut SqliteConnection,
        target: &TargetId,
        low: i64,
        high: i64,
        now: i64,
    ) -> Result<u64> {
        if low <= 0 || high < low {
            return Ok(0);
        }

        // SQLite default SQLITE_MAX_VARIABLE_NUMBER is 999.
        // Each id uses 5 bind variables, so max 199 ids per batch.
        const MAX_IDS_PER_BATCH: i64 = 199;

        let mut inserted = 0;
        let mut start = low;
        while start <= high {
            let end = high.min(start + MAX_IDS_PER_BATCH - 1);

            let mut query_builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO continuity (target_id, expected_item_id, status, first_seen_at, last_checked_at) ",
            );
            query_builder.push_values(start..=end, |mut b, id| {
                b.push_bind(target.as_str())
                    .push_bind(id)
                    .push_bind(ContinuityStatus::Unknown.as_str())
                    .push_bind(now)
                    .push_bind(now);
            });

            let result = query_builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(|e| query_failed("insert expected range", e))?;
            inserted += result.rows_affected();

            start = end + 1;
        }

        Ok(inserted)
    }

    async fn observe(
        conn: &mut SqliteConnection,
        target: &TargetId,
        observation: &Observation,
        now: i64,
    ) -> Result<ContinuityStatus> {
        let existing: Option<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT status, text_checksum FROM continuity
            WHERE target_id = ? AND expected_item_id = ?
            "#,
        )
        .bind(target)
        .bind(observation.item_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_failed("read continuity row", e))?;

        let previous_status = existing.as_ref().map(|(s, _)| ContinuityStatus::parse(s));
        let previous_checksum = existing.and_then(|(_, c)| c);

        // `unknown` is what absence looks like; it never overrides a real status
        if observation.status == ContinuityStatus::Unknown {
            if let Some(previous) = previous_status {
                return Ok(previous);
            }
            Self::insert_expected_range(conn, target, observation.item_id, observation.item_id, now)
                .await?;
            return Ok(ContinuityStatus::Unknown);
        }

        let mut status = observation.status;
        if status.is_observed() {
            let changed = matches!(
                (&previous_checksum, &observation.text_checksum),
                (Some(before), Some(after)) if before != after
            );
            if changed || previous_status == Some(ContinuityStatus::Edited) {
                status = ContinuityStatus::Edited;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO continuity (
                target_id, expected_item_id, status, first_seen_at, last_checked_at, text_checksum
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(target_id, expected_item_id) DO UPDATE SET
                status = excluded.status,
                last_checked_at = excluded.last_checked_at,
                text_checksum = COALESCE(excluded.text_checksum, continuity.text_checksum)
            "#,
        )
        .bind(target)
        .bind(observation.item_id)
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .bind(&observation.text_checksum)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_failed("upsert continuity row", e))?;

        // Re-applying the same page must not grow the history
        let last: Option<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT status, text_checksum FROM status_history
            WHERE target_id = ? AND item_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(target)
        .bind(observation.item_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_failed("read status history", e))?;

        let unchanged = last.is_some_and(|(s, c)| s == status.as_str() && c == observation.text_checksum);
        if !unchanged {
            sqlx::query(
                r#"
                INSERT INTO status_history (
                    target_id, item_id, observed_at, status, text_checksum, text_length
                ) VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(target)
            .bind(observation.item_id)
            .bind(now)
            .bind(status.as_str())
            .bind(&observation.text_checksum)
            .bind(observation.text_length)
            .execute(&mut *conn)
            .await
            .map_err(|e| query_failed("append status history", e))?;
        }

        if status == ContinuityStatus::Edited && previous_status != Some(ContinuityStatus::Edited) {
            tracing::info!(
                target_id = %target,
                item_id = observation.item_id,
                "item text changed since an earlier observation"
            );
        }

        Ok(status)
    }
}
